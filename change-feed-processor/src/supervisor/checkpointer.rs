use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseManager};
use crate::metrics_consts::CHECKPOINTS;

/// The lease a supervisor holds, shared by its renew and processing loops.
/// Holding the mutex across a write keeps the two from racing on the
/// concurrency token.
pub(crate) type SharedLease = Arc<Mutex<Lease>>;

/// Persists progress for one supervised partition.
pub struct Checkpointer {
    manager: Arc<LeaseManager>,
    lease: SharedLease,
}

impl Checkpointer {
    pub(crate) fn new(manager: Arc<LeaseManager>, lease: SharedLease) -> Self {
        Self { manager, lease }
    }

    /// Store `continuation` on the lease. Any failure means this worker can
    /// no longer prove it owns the lease and is reported as
    /// [`Error::LeaseLost`].
    pub async fn checkpoint(&self, continuation: &str) -> Result<()> {
        let mut lease = self.lease.lock().await;
        match self.manager.checkpoint(&lease, continuation).await {
            Ok(updated) => {
                *lease = updated;
                metrics::counter!(CHECKPOINTS).increment(1);
                Ok(())
            }
            Err(e @ Error::LeaseLost(_)) => Err(e),
            Err(e) => {
                warn!(
                    partition = %lease.partition_token,
                    error = %e,
                    "checkpoint failed, giving up the lease"
                );
                Err(Error::LeaseLost(lease.partition_token.clone()))
            }
        }
    }
}
