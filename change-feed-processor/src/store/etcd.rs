use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, KeyValue, PutOptions, Txn, TxnOp, TxnOpResponse,
    TxnResponse,
};

use super::{Document, DocumentStore};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations, e.g. "/change-feed/".
    pub prefix: String,
}

/// [`DocumentStore`] on top of etcd.
///
/// The version tag of a document is its etcd `mod_revision`. Conditional
/// writes are single transactions comparing that revision, with a `get` in
/// the failure branch so a missing key can be told apart from a stale tag.
/// Documents with a TTL are attached to a freshly granted etcd lease.
///
/// `Client` is `Clone` (wraps an inner `Arc`), so each method clones it cheaply.
#[derive(Clone)]
pub struct EtcdDocumentStore {
    client: Client,
    config: StoreConfig,
}

impl EtcdDocumentStore {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        Ok(Self { client, config })
    }

    pub fn from_client(client: Client, config: StoreConfig) -> Self {
        Self { client, config }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    fn to_document(&self, kv: &KeyValue) -> Result<Document> {
        let full = kv
            .key_str()
            .map_err(|e| Error::invalid_state(format!("non-utf8 key in store: {e}")))?;
        let key = full.strip_prefix(self.config.prefix.as_str()).unwrap_or(full);
        Ok(Document {
            key: key.to_string(),
            value: kv.value().to_vec(),
            version: kv.mod_revision().to_string(),
        })
    }

    async fn grant_ttl(&self, ttl: Duration) -> Result<i64> {
        // etcd TTLs are whole seconds; round up.
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let secs = i64::try_from(secs).unwrap_or(i64::MAX).max(1);
        let resp = self.client.clone().lease_grant(secs, None).await?;
        Ok(resp.id())
    }

    async fn revoke_ttl(&self, lease_id: i64) {
        if let Err(e) = self.client.clone().lease_revoke(lease_id).await {
            tracing::warn!(lease_id, error = %e, "failed to revoke unused etcd lease");
        }
    }

    /// Distinguish "gone" from "changed" after a failed compare. The failure
    /// branch of every conditional txn is a single `get` of the key.
    fn precondition_error(key: &str, resp: &TxnResponse) -> Error {
        let exists = resp.op_responses().iter().any(|op| match op {
            TxnOpResponse::Get(get) => !get.kvs().is_empty(),
            _ => false,
        });
        if exists {
            Error::PreconditionFailed(key.to_string())
        } else {
            Error::NotFound(key.to_string())
        }
    }
}

fn txn_revision(resp: &TxnResponse) -> Result<String> {
    resp.header()
        .map(|h| h.revision().to_string())
        .ok_or_else(|| Error::invalid_state("etcd txn response missing header"))
}

fn parse_revision(key: &str, if_match: &str) -> Result<i64> {
    if_match
        .parse::<i64>()
        .map_err(|_| Error::PreconditionFailed(key.to_string()))
}

#[async_trait]
impl DocumentStore for EtcdDocumentStore {
    async fn read(&self, key: &str) -> Result<Option<Document>> {
        let resp = self.client.clone().get(self.full_key(key), None).await?;
        resp.kvs().first().map(|kv| self.to_document(kv)).transpose()
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Option<String>> {
        let full = self.full_key(key);
        let lease_id = match ttl {
            Some(ttl) => Some(self.grant_ttl(ttl).await?),
            None => None,
        };
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));

        let txn = Txn::new()
            .when(vec![Compare::version(full.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(full, value, options)]);
        let resp = self.client.clone().txn(txn).await?;

        if resp.succeeded() {
            return Ok(Some(txn_revision(&resp)?));
        }
        if let Some(id) = lease_id {
            self.revoke_ttl(id).await;
        }
        Ok(None)
    }

    async fn upsert(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<String> {
        let options = match ttl {
            Some(ttl) => Some(PutOptions::new().with_lease(self.grant_ttl(ttl).await?)),
            None => None,
        };
        let resp = self
            .client
            .clone()
            .put(self.full_key(key), value, options)
            .await?;
        resp.header()
            .map(|h| h.revision().to_string())
            .ok_or_else(|| Error::invalid_state("etcd put response missing header"))
    }

    async fn replace(&self, key: &str, value: Vec<u8>, if_match: &str) -> Result<String> {
        let full = self.full_key(key);
        let revision = parse_revision(key, if_match)?;

        // Keep whatever etcd lease the key is attached to.
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                full.clone(),
                CompareOp::Equal,
                revision,
            )])
            .and_then(vec![TxnOp::put(
                full.clone(),
                value,
                Some(PutOptions::new().with_ignore_lease()),
            )])
            .or_else(vec![TxnOp::get(full, None)]);
        let resp = self.client.clone().txn(txn).await?;

        if resp.succeeded() {
            txn_revision(&resp)
        } else {
            Err(Self::precondition_error(key, &resp))
        }
    }

    async fn delete(&self, key: &str, if_match: Option<&str>) -> Result<()> {
        let full = self.full_key(key);
        match if_match {
            None => {
                let resp = self.client.clone().delete(full, None).await?;
                if resp.deleted() == 0 {
                    return Err(Error::NotFound(key.to_string()));
                }
                Ok(())
            }
            Some(tag) => {
                let revision = parse_revision(key, tag)?;
                let txn = Txn::new()
                    .when(vec![Compare::mod_revision(
                        full.clone(),
                        CompareOp::Equal,
                        revision,
                    )])
                    .and_then(vec![TxnOp::delete(full.clone(), None)])
                    .or_else(vec![TxnOp::get(full, None)]);
                let resp = self.client.clone().txn(txn).await?;
                if resp.succeeded() {
                    Ok(())
                } else {
                    Err(Self::precondition_error(key, &resp))
                }
            }
        }
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        let options = GetOptions::new().with_prefix();
        let resp = self
            .client
            .clone()
            .get(self.full_key(prefix), Some(options))
            .await?;
        resp.kvs().iter().map(|kv| self.to_document(kv)).collect()
    }
}
