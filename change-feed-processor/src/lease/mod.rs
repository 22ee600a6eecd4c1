//! Durable per-partition ownership and progress records.

pub mod container;
pub mod manager;
pub mod store;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Document;

pub use container::LeaseContainer;
pub use manager::LeaseManager;
pub use store::LeaseStore;

/// Ownership and progress of one partition of the monitored feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub partition_token: String,
    /// Worker instance holding the lease. `None` = up for grabs.
    pub owner: Option<String>,
    /// Where processing resumes. `None` = the processor's configured start.
    pub continuation_token: Option<String>,
    /// Version tag of the document this copy was read from or written as.
    #[serde(skip)]
    pub concurrency_token: Option<String>,
    /// Last time any worker wrote the lease.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Lease {
    pub fn new(id: String, partition_token: String, continuation_token: Option<String>) -> Self {
        Self {
            id,
            partition_token,
            owner: None,
            continuation_token,
            concurrency_token: None,
            timestamp: Utc::now(),
            properties: HashMap::new(),
        }
    }

    pub(crate) fn from_document(doc: &Document) -> Result<Self> {
        let mut lease: Lease = doc.parse()?;
        lease.concurrency_token = Some(doc.version.clone());
        Ok(lease)
    }

    pub fn is_owned_by(&self, worker: &str) -> bool {
        self.owner.as_deref() == Some(worker)
    }

    /// Unowned, or not written by its owner within `expiration`.
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        if self.owner.is_none() {
            return true;
        }
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => self.timestamp + expiration < now,
            Err(_) => false,
        }
    }
}

/// Every key the processor writes under its lease prefix.
pub(crate) enum StoreKey<'a> {
    Lease(&'a str),
    LeasesPrefix,
    Info,
    Lock,
    Worker(&'a str),
    WorkersPrefix,
}

impl StoreKey<'_> {
    pub(crate) fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Lease(token) => format!("{prefix}.{token}"),
            StoreKey::LeasesPrefix => format!("{prefix}."),
            StoreKey::Info => format!("{prefix}.info"),
            StoreKey::Lock => format!("{prefix}.lock"),
            StoreKey::Worker(name) => format!("{prefix}/workers/{name}"),
            StoreKey::WorkersPrefix => format!("{prefix}/workers/"),
        }
    }
}
