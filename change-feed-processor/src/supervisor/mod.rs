//! Per-partition supervision: a renew loop and a processing loop sharing one
//! lease, run until shutdown or until either loop fails.

pub mod checkpointer;
pub(crate) mod processor;
pub(crate) mod renewer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProcessorOptions;
use crate::error::{Error, Result};
use crate::feed::ChangeFeedSource;
use crate::lease::{Lease, LeaseManager};
use crate::observer::{ChangeFeedContext, ChangeFeedObserver, ChangeFeedObserverFactory, CloseReason};

use checkpointer::Checkpointer;
use processor::FeedProcessor;

#[async_trait]
pub trait PartitionSupervisor: Send {
    /// Supervise the partition until `shutdown` fires (`Ok`) or something
    /// ends supervision early (`Err`: lease lost, partition gone, observer
    /// failure). Returns only after both loops have exited.
    async fn run(&mut self, shutdown: CancellationToken) -> Result<()>;
}

pub trait PartitionSupervisorFactory: Send + Sync {
    fn create(&self, lease: Lease) -> Box<dyn PartitionSupervisor>;
}

pub struct DefaultSupervisorFactory {
    manager: Arc<LeaseManager>,
    source: Arc<dyn ChangeFeedSource>,
    observers: Arc<dyn ChangeFeedObserverFactory>,
    options: ProcessorOptions,
    renew_interval: Duration,
}

impl DefaultSupervisorFactory {
    pub fn new(
        manager: Arc<LeaseManager>,
        source: Arc<dyn ChangeFeedSource>,
        observers: Arc<dyn ChangeFeedObserverFactory>,
        options: ProcessorOptions,
        renew_interval: Duration,
    ) -> Self {
        Self {
            manager,
            source,
            observers,
            options,
            renew_interval,
        }
    }
}

impl PartitionSupervisorFactory for DefaultSupervisorFactory {
    fn create(&self, lease: Lease) -> Box<dyn PartitionSupervisor> {
        let partition = lease.partition_token.clone();
        let continuation = lease.continuation_token.clone();
        let shared = Arc::new(Mutex::new(lease));
        let checkpointer = Arc::new(Checkpointer::new(self.manager.clone(), shared.clone()));
        let processor = FeedProcessor::new(
            self.source.clone(),
            checkpointer.clone(),
            self.options.clone(),
            partition.clone(),
            continuation.clone(),
        );
        Box::new(DefaultPartitionSupervisor {
            partition: partition.clone(),
            manager: self.manager.clone(),
            lease: shared,
            renew_interval: self.renew_interval,
            observer: self.observers.create(),
            processor,
            ctx: ChangeFeedContext::new(partition, continuation, checkpointer),
        })
    }
}

struct DefaultPartitionSupervisor {
    partition: String,
    manager: Arc<LeaseManager>,
    lease: checkpointer::SharedLease,
    renew_interval: Duration,
    observer: Box<dyn ChangeFeedObserver>,
    processor: FeedProcessor,
    ctx: ChangeFeedContext,
}

fn close_reason(result: &Result<()>) -> CloseReason {
    match result {
        Ok(()) => CloseReason::Shutdown,
        Err(Error::LeaseLost(_)) => CloseReason::LeaseLost,
        Err(Error::PartitionGone { .. }) => CloseReason::LeaseGone,
        Err(Error::Observer { .. }) => CloseReason::ObserverError,
        Err(Error::FeedNotFound(_)) => CloseReason::ResourceGone,
        Err(_) => CloseReason::Unknown,
    }
}

#[async_trait]
impl PartitionSupervisor for DefaultPartitionSupervisor {
    async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self.observer.open(&self.ctx).await {
            let result = Err(Error::Observer {
                partition: self.partition.clone(),
                reason: format!("open failed: {e:#}"),
            });
            self.close(&result).await;
            return result;
        }

        // Whichever loop finishes first takes the other one down with it.
        let stop = shutdown.child_token();
        let renew = {
            let stop = stop.clone();
            let fut = renewer::run_lease_renewer(
                self.manager.clone(),
                self.lease.clone(),
                self.renew_interval,
                stop.clone(),
            );
            async move {
                let result = fut.await;
                stop.cancel();
                result
            }
        };
        let process = async {
            let result = self.processor.run(self.observer.as_mut(), &stop).await;
            stop.cancel();
            result
        };
        let (renew_result, process_result) = tokio::join!(renew, process);

        let result = match (renew_result, process_result) {
            (Err(e), _) => Err(e),
            (Ok(()), result) => result,
        };
        self.close(&result).await;
        result
    }
}

impl DefaultPartitionSupervisor {
    async fn close(&mut self, result: &Result<()>) {
        let reason = close_reason(result);
        info!(partition = %self.partition, reason = ?reason, "closing observer");
        if let Err(e) = self.observer.close(&self.ctx, reason).await {
            warn!(partition = %self.partition, error = %e, "observer close failed");
        }
    }
}
