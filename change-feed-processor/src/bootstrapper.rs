use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BootstrapOptions;
use crate::error::{Error, Result};
use crate::lease::LeaseStore;
use crate::synchronizer::PartitionSynchronizer;

/// Makes sure exactly one worker of a cold fleet creates the initial leases.
///
/// Workers race for a TTL-bounded lock document. The winner creates the
/// missing leases, writes the initialized marker and drops the lock; everyone
/// else polls until the marker shows up (or the lock expires and they win it).
pub struct Bootstrapper {
    synchronizer: Arc<PartitionSynchronizer>,
    lease_store: Arc<LeaseStore>,
    options: BootstrapOptions,
}

impl Bootstrapper {
    pub fn new(
        synchronizer: Arc<PartitionSynchronizer>,
        lease_store: Arc<LeaseStore>,
        options: BootstrapOptions,
    ) -> Self {
        Self {
            synchronizer,
            lease_store,
            options,
        }
    }

    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.lease_store.is_initialized().await? {
                debug!("lease store already initialized");
                return Ok(());
            }

            if self
                .lease_store
                .acquire_initialization_lock(self.options.lock_time)
                .await?
            {
                info!("acquired initialization lock, creating leases");
                let result = self.initialize_locked().await;
                if let Err(e) = self.lease_store.release_initialization_lock().await {
                    warn!(error = %e, "failed to release initialization lock");
                }
                return result;
            }

            debug!(
                sleep_ms = millis(self.options.sleep_time),
                "another worker is initializing the lease store"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::invalid_state("bootstrap cancelled"));
                }
                _ = tokio::time::sleep(self.options.sleep_time) => {}
            }
        }
    }

    async fn initialize_locked(&self) -> Result<()> {
        // The previous lock holder may have finished between our check and
        // our lock.
        if self.lease_store.is_initialized().await? {
            debug!("lease store initialized while waiting for the lock");
            return Ok(());
        }
        let created = self.synchronizer.create_missing_leases().await?;
        self.lease_store.mark_initialized().await?;
        info!(created, "lease store initialized");
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
