use std::sync::Arc;

use chrono::Utc;

use super::{Lease, StoreKey};
use crate::error::{Error, Result};
use crate::store::{to_json, DocumentStore};

/// Attempts per lease mutation before giving up on a hot document.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Who must own the stored copy for a retried mutation to proceed.
#[derive(Clone, Copy)]
enum Expect {
    /// Nobody. A lease someone else wrote since our scan is theirs.
    Unowned,
    /// The calling worker.
    Me,
}

/// Single-document lease mutations guarded by the lease's version tag.
///
/// Every mutation writes against the concurrency token the caller holds. When
/// the stored version has moved on, the lease is re-read: if it is gone or now
/// belongs to someone other than expected the mutation fails with
/// [`Error::LeaseLost`], otherwise it is re-applied to the fresh copy.
///
/// `acquire` only retries onto a fresh copy that is unowned. An owned lease
/// whose version moved since the caller read it was renewed by its owner, so
/// it is left alone even if the same owner looked expired before.
pub struct LeaseManager {
    store: Arc<dyn DocumentStore>,
    prefix: String,
    worker: String,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: String, worker: String) -> Self {
        Self {
            store,
            prefix,
            worker,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn lease_id(&self, partition_token: &str) -> String {
        StoreKey::Lease(partition_token).resolve(&self.prefix)
    }

    pub async fn read(&self, partition_token: &str) -> Result<Option<Lease>> {
        self.store
            .read(&self.lease_id(partition_token))
            .await?
            .map(|doc| Lease::from_document(&doc))
            .transpose()
    }

    /// Returns `None` when a lease for the partition already exists.
    pub async fn create_lease_if_not_exist(
        &self,
        partition_token: &str,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>> {
        let mut lease = Lease::new(
            self.lease_id(partition_token),
            partition_token.to_string(),
            continuation_token,
        );
        match self.store.create(&lease.id, to_json(&lease)?, None).await? {
            Some(version) => {
                tracing::info!(partition = %partition_token, "created lease");
                lease.concurrency_token = Some(version);
                Ok(Some(lease))
            }
            None => {
                tracing::debug!(partition = %partition_token, "lease already exists");
                Ok(None)
            }
        }
    }

    pub async fn acquire(&self, lease: &Lease) -> Result<Lease> {
        let worker = self.worker.clone();
        self.update(lease, Expect::Unowned, move |l| {
            l.owner = Some(worker.clone());
        })
        .await
    }

    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        self.update(lease, Expect::Me, |_| {}).await
    }

    pub async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> Result<Lease> {
        let token = continuation_token.to_string();
        self.update(lease, Expect::Me, move |l| {
            l.continuation_token = Some(token.clone());
        })
        .await
    }

    /// Write the lease's `properties` bag.
    pub async fn update_properties(&self, lease: &Lease) -> Result<Lease> {
        let properties = lease.properties.clone();
        self.update(lease, Expect::Me, move |l| {
            l.properties = properties.clone();
        })
        .await
    }

    /// Clear the owner. A lease that no longer exists counts as released.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        match self
            .update(lease, Expect::Me, |l| {
                l.owner = None;
            })
            .await
        {
            Ok(_) => {
                tracing::info!(partition = %lease.partition_token, "released lease");
                Ok(())
            }
            Err(Error::LeaseLost(partition)) => {
                if self.read(&lease.partition_token).await?.is_none() {
                    return Ok(());
                }
                Err(Error::LeaseLost(partition))
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort removal; a missing lease is not an error.
    pub async fn delete(&self, lease: &Lease) -> Result<()> {
        match self.store.delete(&lease.id, None).await {
            Ok(()) => {
                tracing::info!(partition = %lease.partition_token, "deleted lease");
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn update<F>(&self, lease: &Lease, expect: Expect, mutate: F) -> Result<Lease>
    where
        F: Fn(&mut Lease),
    {
        let lost = || Error::LeaseLost(lease.partition_token.clone());
        let mut current = lease.clone();

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(version) = current.concurrency_token.clone() else {
                return Err(Error::invalid_state(format!(
                    "lease {} has no concurrency token",
                    current.id
                )));
            };

            let mut next = current.clone();
            mutate(&mut next);
            next.timestamp = Utc::now();

            match self
                .store
                .replace(&next.id, to_json(&next)?, &version)
                .await
            {
                Ok(new_version) => {
                    next.concurrency_token = Some(new_version);
                    return Ok(next);
                }
                Err(Error::NotFound(_)) => return Err(lost()),
                Err(Error::PreconditionFailed(_)) => {
                    let fresh = self
                        .read(&current.partition_token)
                        .await?
                        .ok_or_else(lost)?;
                    let still_expected = match expect {
                        Expect::Unowned => fresh.owner.is_none(),
                        Expect::Me => fresh.is_owned_by(&self.worker),
                    };
                    if !still_expected {
                        tracing::debug!(
                            partition = %fresh.partition_token,
                            owner = ?fresh.owner,
                            "lease changed hands underneath us"
                        );
                        return Err(lost());
                    }
                    current = fresh;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(partition = %lease.partition_token, "lease update kept conflicting");
        Err(lost())
    }
}
