use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checkpointer::SharedLease;
use crate::error::{Error, Result};
use crate::lease::LeaseManager;

/// Keep the lease fresh until cancelled. The first renewal happens half an
/// interval in, so a lease acquired just before a slow start is not left to
/// expire.
///
/// Any failure, transient or not, is reported as [`Error::LeaseLost`]:
/// another worker may already be processing the partition.
pub(crate) async fn run_lease_renewer(
    manager: Arc<LeaseManager>,
    lease: SharedLease,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut delay = interval / 2;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = interval;

        let mut held = lease.lock().await;
        match manager.renew(&held).await {
            Ok(renewed) => {
                debug!(partition = %renewed.partition_token, "renewed lease");
                *held = renewed;
            }
            Err(e) => {
                if !e.is_lease_lost() {
                    warn!(
                        partition = %held.partition_token,
                        error = %e,
                        "lease renewal failed"
                    );
                }
                return Err(Error::LeaseLost(held.partition_token.clone()));
            }
        }
    }
}
