use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::health::{HealthMonitor, MonitoredOperation};
use crate::lease::{Lease, LeaseContainer, LeaseManager};
use crate::metrics_consts::{OWNED_LEASES, PARTITION_SPLITS};
use crate::supervisor::PartitionSupervisorFactory;
use crate::synchronizer::PartitionSynchronizer;

/// Runs one supervisor per lease this worker owns and reacts to how each
/// one ends.
///
/// A supervisor that stops on shutdown or an observer failure gets its lease
/// released; one that lost its lease is just dropped; one whose partition
/// split is replaced by supervisors for the children. Failures are reported
/// to the [`HealthMonitor`] and never escape a partition task.
#[derive(Clone)]
pub struct PartitionController {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<LeaseManager>,
    container: Arc<LeaseContainer>,
    synchronizer: Arc<PartitionSynchronizer>,
    supervisors: Arc<dyn PartitionSupervisorFactory>,
    health: Arc<dyn HealthMonitor>,
    /// Stop handle per supervised partition token. An entry is reserved
    /// before the lease is acquired, so two callers cannot start the same
    /// partition twice.
    running: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Inner {
    fn running(&self) -> Result<MutexGuard<'_, HashMap<String, CancellationToken>>> {
        self.running
            .lock()
            .map_err(|_| Error::invalid_state("partition controller state poisoned"))
    }

    /// Reserve `token`. `None` if it is already supervised or we are stopping.
    fn reserve(&self, token: &str) -> Result<Option<CancellationToken>> {
        let mut running = self.running()?;
        if self.shutdown.is_cancelled() || running.contains_key(token) {
            return Ok(None);
        }
        let stop = self.shutdown.child_token();
        running.insert(token.to_string(), stop.clone());
        metrics::gauge!(OWNED_LEASES).set(running.len() as f64);
        Ok(Some(stop))
    }

    fn forget(&self, token: &str) {
        if let Ok(mut running) = self.running() {
            running.remove(token);
            metrics::gauge!(OWNED_LEASES).set(running.len() as f64);
        }
    }
}

impl PartitionController {
    pub fn new(
        manager: Arc<LeaseManager>,
        container: Arc<LeaseContainer>,
        synchronizer: Arc<PartitionSynchronizer>,
        supervisors: Arc<dyn PartitionSupervisorFactory>,
        health: Arc<dyn HealthMonitor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                container,
                synchronizer,
                supervisors,
                health,
                running: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Pick up supervision of every lease already recorded as ours, e.g.
    /// after a restart under the same instance name.
    pub async fn initialize(&self) -> Result<()> {
        let owned = self
            .inner
            .container
            .owned_leases(self.inner.manager.worker())
            .await?;
        info!(count = owned.len(), "re-adopting owned leases");
        for lease in owned {
            self.add_or_update_lease(lease).await?;
        }
        Ok(())
    }

    /// Acquire `lease` and start supervising it, unless it already is.
    ///
    /// Losing the acquire race is not an error: the lease is reported to the
    /// health monitor and left to its new owner.
    pub async fn add_or_update_lease(&self, lease: Lease) -> Result<()> {
        add_lease(&self.inner, lease, None).await
    }

    /// Stop supervising `partition_token` and release its lease. Returns
    /// whether the partition was supervised here.
    pub fn release_lease(&self, partition_token: &str) -> Result<bool> {
        let running = self.inner.running()?;
        match running.get(partition_token) {
            Some(stop) => {
                debug!(partition = %partition_token, "stopping supervisor to release lease");
                stop.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn owned_partitions(&self) -> Result<HashSet<String>> {
        Ok(self.inner.running()?.keys().cloned().collect())
    }

    /// Stop every supervisor and wait for all of them to exit and release
    /// their leases. Later calls to `add_or_update_lease` are ignored.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("partition controller stopped");
    }
}

/// Acquire and start. When `inherited` is given (split children) those
/// properties are merged into the child lease right after acquiring it.
async fn add_lease(
    inner: &Arc<Inner>,
    lease: Lease,
    inherited: Option<&HashMap<String, String>>,
) -> Result<()> {
    let token = lease.partition_token.clone();
    let Some(stop) = inner.reserve(&token)? else {
        debug!(partition = %token, "partition already supervised");
        return Ok(());
    };

    let acquired = match inner.manager.acquire(&lease).await {
        Ok(acquired) => acquired,
        Err(e) => {
            inner.forget(&token);
            inner
                .health
                .notify_error(MonitoredOperation::AcquireLease, Some(&token), &e);
            return if e.is_lease_lost() { Ok(()) } else { Err(e) };
        }
    };

    let acquired = match inherited {
        Some(properties) if !properties.is_empty() => {
            let mut child = acquired;
            for (k, v) in properties {
                child.properties.entry(k.clone()).or_insert_with(|| v.clone());
            }
            match inner.manager.update_properties(&child).await {
                Ok(updated) => updated,
                Err(e) => {
                    inner.forget(&token);
                    inner
                        .health
                        .notify_error(MonitoredOperation::SplitPartition, Some(&token), &e);
                    return Ok(());
                }
            }
        }
        _ => acquired,
    };

    inner.health.notify_lease_acquire(&token);
    start_supervisor(inner, acquired, stop);
    Ok(())
}

fn start_supervisor(inner: &Arc<Inner>, lease: Lease, stop: CancellationToken) {
    let task_inner = inner.clone();
    inner
        .tracker
        .spawn(async move { run_partition(task_inner, lease, stop).await });
}

async fn run_partition(inner: Arc<Inner>, lease: Lease, stop: CancellationToken) {
    let token = lease.partition_token.clone();
    let mut supervisor = inner.supervisors.create(lease.clone());
    let result = supervisor.run(stop).await;
    inner.forget(&token);

    match result {
        Ok(()) => release(&inner, &lease).await,
        Err(Error::PartitionGone { continuation, .. }) => {
            handle_split(&inner, lease, continuation).await;
        }
        Err(e) if e.is_lease_lost() => {
            inner
                .health
                .notify_error(MonitoredOperation::ProcessChanges, Some(&token), &e);
        }
        Err(e) => {
            inner
                .health
                .notify_error(MonitoredOperation::ProcessChanges, Some(&token), &e);
            release(&inner, &lease).await;
        }
    }
}

async fn release(inner: &Arc<Inner>, lease: &Lease) {
    match inner.manager.release(lease).await {
        Ok(()) => inner.health.notify_lease_release(&lease.partition_token),
        Err(e) => inner.health.notify_error(
            MonitoredOperation::ReleaseLease,
            Some(&lease.partition_token),
            &e,
        ),
    }
}

async fn handle_split(inner: &Arc<Inner>, mut parent: Lease, continuation: Option<String>) {
    let token = parent.partition_token.clone();
    if continuation.is_some() {
        parent.continuation_token = continuation;
    }

    let children = match inner.synchronizer.split_partition(&parent).await {
        Ok(children) => children,
        Err(e) => {
            inner
                .health
                .notify_error(MonitoredOperation::SplitPartition, Some(&token), &e);
            release(inner, &parent).await;
            return;
        }
    };
    metrics::counter!(PARTITION_SPLITS).increment(1);
    info!(
        partition = %token,
        children = children.len(),
        "handing split partition over to its children"
    );

    let me = inner.manager.worker();
    for child in children {
        // A child another worker already claimed stays with it.
        if child.owner.is_some() && !child.is_owned_by(me) {
            continue;
        }
        if let Err(e) = add_lease(inner, child, Some(&parent.properties)).await {
            warn!(partition = %token, error = %e, "failed to start child partition");
        }
    }

    if let Err(e) = inner.manager.delete(&parent).await {
        inner
            .health
            .notify_error(MonitoredOperation::SplitPartition, Some(&token), &e);
    }
}
