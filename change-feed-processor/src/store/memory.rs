use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Document, DocumentStore};
use crate::error::{Error, Result};

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    next_version: u64,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.is_live(now));
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn write(&mut self, key: &str, value: Vec<u8>, expires_at: Option<Instant>) -> String {
        let version = self.bump();
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at,
            },
        );
        version.to_string()
    }

    fn check(&self, key: &str, if_match: &str) -> Result<&Entry> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if entry.version.to_string() != if_match {
            return Err(Error::PreconditionFailed(key.to_string()));
        }
        Ok(entry)
    }
}

/// Process-local [`DocumentStore`]. Used by tests and by single-process
/// deployments that do not need leases to survive a restart.
///
/// TTLs are measured on the tokio clock, so paused-time tests can expire
/// documents with `tokio::time::advance`.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::invalid_state("in-memory store mutex poisoned"))?;
        guard.purge_expired();
        Ok(guard)
    }

    fn snapshot(key: &str, entry: &Entry) -> Document {
        Document {
            key: key.to_string(),
            value: entry.value.clone(),
            version: entry.version.to_string(),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Document>> {
        let inner = self.lock()?;
        Ok(inner.entries.get(key).map(|e| Self::snapshot(key, e)))
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        if inner.entries.contains_key(key) {
            return Ok(None);
        }
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        Ok(Some(inner.write(key, value, expires_at)))
    }

    async fn upsert(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<String> {
        let mut inner = self.lock()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        Ok(inner.write(key, value, expires_at))
    }

    async fn replace(&self, key: &str, value: Vec<u8>, if_match: &str) -> Result<String> {
        let mut inner = self.lock()?;
        let expires_at = inner.check(key, if_match)?.expires_at;
        Ok(inner.write(key, value, expires_at))
    }

    async fn delete(&self, key: &str, if_match: Option<&str>) -> Result<()> {
        let mut inner = self.lock()?;
        match if_match {
            Some(tag) => {
                inner.check(key, tag)?;
            }
            None if !inner.entries.contains_key(key) => {
                return Err(Error::NotFound(key.to_string()));
            }
            None => {}
        }
        inner.entries.remove(key);
        Ok(())
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| Self::snapshot(k, e))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_if_absent_has_one_winner() {
        let store = InMemoryStore::new();
        let first = store.create("a", b"1".to_vec(), None).await.unwrap();
        let second = store.create("a", b"2".to_vec(), None).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.read("a").await.unwrap().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn replace_checks_version() {
        let store = InMemoryStore::new();
        let v1 = store.create("a", b"1".to_vec(), None).await.unwrap().unwrap();
        let v2 = store.replace("a", b"2".to_vec(), &v1).await.unwrap();
        assert_ne!(v1, v2);

        let stale = store.replace("a", b"3".to_vec(), &v1).await.unwrap_err();
        assert!(matches!(stale, Error::PreconditionFailed(_)));

        let missing = store.replace("b", b"3".to_vec(), &v2).await.unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_reports_missing_and_stale() {
        let store = InMemoryStore::new();
        let v1 = store.upsert("a", b"1".to_vec(), None).await.unwrap();
        store.upsert("a", b"2".to_vec(), None).await.unwrap();

        assert!(matches!(
            store.delete("a", Some(&v1)).await,
            Err(Error::PreconditionFailed(_))
        ));
        store.delete("a", None).await.unwrap();
        assert!(matches!(
            store.delete("a", None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_documents_expire() {
        let store = InMemoryStore::new();
        store
            .create("lock", b"x".to_vec(), Some(Duration::from_secs(30)))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.read("lock").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.read("lock").await.unwrap().is_none());
        assert!(store
            .create("lock", b"y".to_vec(), Some(Duration::from_secs(30)))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn query_prefix_is_ordered_and_bounded() {
        let store = InMemoryStore::new();
        for key in ["p.2", "p.1", "q.1", "p.info"] {
            store.upsert(key, b"{}".to_vec(), None).await.unwrap();
        }
        let keys: Vec<_> = store
            .query_prefix("p.")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["p.1", "p.2", "p.info"]);
    }
}
