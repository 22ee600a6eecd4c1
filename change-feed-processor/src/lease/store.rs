use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreKey;
use crate::error::{Error, Result};
use crate::store::{to_json, DocumentStore};

/// Marker written once the fleet has created its initial leases.
#[derive(Debug, Serialize, Deserialize)]
struct InitializedMarker {
    initialized_at: DateTime<Utc>,
}

/// Bootstrap lock document. Expires on its own after the lock TTL.
#[derive(Debug, Serialize, Deserialize)]
struct InitializationLock {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// Presence record of a running worker, refreshed every balancing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub heartbeat_at: DateTime<Utc>,
}

/// Fleet-wide bookkeeping documents that live next to the leases: the
/// initialization marker, the bootstrap lock and worker presence.
pub struct LeaseStore {
    store: Arc<dyn DocumentStore>,
    prefix: String,
    worker: String,
    /// Version of the lock document this instance holds, if any.
    lock_version: Mutex<Option<String>>,
}

impl LeaseStore {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: String, worker: String) -> Self {
        Self {
            store,
            prefix,
            worker,
            lock_version: Mutex::new(None),
        }
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.prefix)
    }

    fn set_lock_version(&self, version: Option<String>) -> Result<()> {
        let mut guard = self
            .lock_version
            .lock()
            .map_err(|_| Error::invalid_state("lease store lock state poisoned"))?;
        *guard = version;
        Ok(())
    }

    // ── Initialization ──────────────────────────────────────────

    pub async fn is_initialized(&self) -> Result<bool> {
        Ok(self.store.read(&self.key(StoreKey::Info)).await?.is_some())
    }

    /// Returns `false` if another worker already wrote the marker.
    pub async fn mark_initialized(&self) -> Result<bool> {
        let marker = InitializedMarker {
            initialized_at: Utc::now(),
        };
        let created = self
            .store
            .create(&self.key(StoreKey::Info), to_json(&marker)?, None)
            .await?;
        Ok(created.is_some())
    }

    /// Try to take the bootstrap lock. The lock disappears after `ttl` even if
    /// the holder crashes.
    pub async fn acquire_initialization_lock(&self, ttl: Duration) -> Result<bool> {
        let lock = InitializationLock {
            holder: self.worker.clone(),
            acquired_at: Utc::now(),
        };
        let created = self
            .store
            .create(&self.key(StoreKey::Lock), to_json(&lock)?, Some(ttl))
            .await?;
        let acquired = created.is_some();
        self.set_lock_version(created)?;
        Ok(acquired)
    }

    /// Release the bootstrap lock if this instance still holds it. Returns
    /// `false` if the lock had already expired or been taken over.
    pub async fn release_initialization_lock(&self) -> Result<bool> {
        let version = {
            let mut guard = self
                .lock_version
                .lock()
                .map_err(|_| Error::invalid_state("lease store lock state poisoned"))?;
            guard.take()
        };
        let Some(version) = version else {
            return Ok(false);
        };

        match self
            .store
            .delete(&self.key(StoreKey::Lock), Some(&version))
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) | Err(Error::PreconditionFailed(_)) => {
                tracing::warn!(
                    worker = %self.worker,
                    "initialization lock expired before it was released"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // ── Worker presence ─────────────────────────────────────────

    pub async fn register_worker(&self, ttl: Duration) -> Result<()> {
        let record = WorkerRecord {
            name: self.worker.clone(),
            heartbeat_at: Utc::now(),
        };
        self.store
            .upsert(
                &self.key(StoreKey::Worker(&self.worker)),
                to_json(&record)?,
                Some(ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        self.store
            .query_prefix(&self.key(StoreKey::WorkersPrefix))
            .await?
            .iter()
            .map(|doc| doc.parse())
            .collect()
    }

    pub async fn unregister_worker(&self) -> Result<()> {
        match self
            .store
            .delete(&self.key(StoreKey::Worker(&self.worker)), None)
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
