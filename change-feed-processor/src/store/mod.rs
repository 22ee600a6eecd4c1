//! Generic document persistence with optimistic concurrency.
//!
//! Every document carries an opaque version tag that changes on each write.
//! Conditional writes (`replace`, `delete` with `if_match`) fail with
//! [`Error::PreconditionFailed`](crate::error::Error::PreconditionFailed) when
//! the stored version differs, and with
//! [`Error::NotFound`](crate::error::Error::NotFound) when the document is
//! absent. Lease documents, the initialization marker, the bootstrap lock and
//! worker presence records all live in one `DocumentStore`.

pub mod etcd;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use etcd::{EtcdDocumentStore, StoreConfig};
pub use memory::InMemoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    pub value: Vec<u8>,
    /// Opaque version tag, used as the `if_match` precondition of later writes.
    pub version: String,
}

impl Document {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Document>>;

    /// Create the document only if no document with that key exists.
    ///
    /// Returns the new version, or `None` when the key is already taken. A
    /// `ttl` makes the document disappear on its own once it elapses.
    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Option<String>>;

    /// Unconditional write. Returns the new version.
    async fn upsert(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<String>;

    /// Conditional write. Returns the new version.
    async fn replace(&self, key: &str, value: Vec<u8>, if_match: &str) -> Result<String>;

    async fn delete(&self, key: &str, if_match: Option<&str>) -> Result<()>;

    /// All documents whose key starts with `prefix`, ordered by key.
    async fn query_prefix(&self, prefix: &str) -> Result<Vec<Document>>;
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}
