use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::PartitionController;
use crate::error::Result;
use crate::health::{HealthMonitor, MonitoredOperation};
use crate::lease::{LeaseContainer, LeaseStore};
use crate::metrics_consts::BALANCING_PASSES;
use crate::strategy::LoadBalancingStrategy;

/// Periodically converges this worker's share of the leases.
pub struct LoadBalancer {
    controller: PartitionController,
    container: Arc<LeaseContainer>,
    lease_store: Arc<LeaseStore>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    health: Arc<dyn HealthMonitor>,
    worker: String,
    acquire_interval: Duration,
    /// TTL of this worker's presence record.
    presence_ttl: Duration,
}

impl LoadBalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: PartitionController,
        container: Arc<LeaseContainer>,
        lease_store: Arc<LeaseStore>,
        strategy: Arc<dyn LoadBalancingStrategy>,
        health: Arc<dyn HealthMonitor>,
        worker: String,
        acquire_interval: Duration,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            controller,
            container,
            lease_store,
            strategy,
            health,
            worker,
            acquire_interval,
            presence_ttl,
        }
    }

    /// Run balancing passes every `acquire_interval` until cancelled. A
    /// failed pass is reported and retried on the next tick. Cancellation
    /// also abandons a pass stuck on the store.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(worker = %self.worker, "load balancer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = %self.worker, "load balancer stopped mid-pass");
                    return Ok(());
                }
                result = self.balance_once() => {
                    if let Err(e) = result {
                        self.health
                            .notify_error(MonitoredOperation::LoadBalancing, None, &e);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = %self.worker, "load balancer stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.acquire_interval) => {}
            }
        }
    }

    /// One pass: announce presence, scan, decide, act.
    pub async fn balance_once(&self) -> Result<()> {
        metrics::counter!(BALANCING_PASSES).increment(1);
        self.lease_store.register_worker(self.presence_ttl).await?;

        let leases = self.container.all_leases().await?;
        let workers: Vec<String> = self
            .lease_store
            .list_workers()
            .await?
            .into_iter()
            .map(|w| w.name)
            .collect();

        let plan = self.strategy.select_leases(&leases, &workers, &self.worker);
        if plan.to_acquire.is_empty() && plan.to_release.is_empty() {
            debug!(worker = %self.worker, leases = leases.len(), "balanced, nothing to do");
            return Ok(());
        }

        for lease in plan.to_release {
            info!(
                worker = %self.worker,
                partition = %lease.partition_token,
                "releasing surplus lease"
            );
            self.controller.release_lease(&lease.partition_token)?;
        }
        for lease in plan.to_acquire {
            self.controller.add_or_update_lease(lease).await?;
        }
        Ok(())
    }
}
