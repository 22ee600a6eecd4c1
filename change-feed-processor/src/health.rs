//! Where lease churn and partition failures get reported.
//!
//! The controller never lets a single partition take the process down: lease
//! loss and unhandled errors stop that partition and are handed to a
//! [`HealthMonitor`] instead.

use tracing::{error, info, warn};

use crate::error::Error;
use crate::metrics_consts::{LEASE_ACQUIRED, LEASE_LOST, LEASE_RELEASED, PROCESSOR_ERRORS};

/// What the processor was doing when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredOperation {
    AcquireLease,
    ReleaseLease,
    ProcessChanges,
    SplitPartition,
    LoadBalancing,
}

impl MonitoredOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquireLease => "acquire_lease",
            Self::ReleaseLease => "release_lease",
            Self::ProcessChanges => "process_changes",
            Self::SplitPartition => "split_partition",
            Self::LoadBalancing => "load_balancing",
        }
    }
}

pub trait HealthMonitor: Send + Sync {
    fn notify_lease_acquire(&self, partition: &str);

    fn notify_lease_release(&self, partition: &str);

    /// `partition` is `None` for failures not tied to one lease.
    fn notify_error(&self, operation: MonitoredOperation, partition: Option<&str>, error: &Error);
}

/// Logs through `tracing` and counts through `metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthMonitor;

impl HealthMonitor for TracingHealthMonitor {
    fn notify_lease_acquire(&self, partition: &str) {
        info!(partition = %partition, "lease acquired");
        metrics::counter!(LEASE_ACQUIRED).increment(1);
    }

    fn notify_lease_release(&self, partition: &str) {
        info!(partition = %partition, "lease released");
        metrics::counter!(LEASE_RELEASED).increment(1);
    }

    fn notify_error(&self, operation: MonitoredOperation, partition: Option<&str>, error: &Error) {
        let partition = partition.unwrap_or("-");
        if error.is_lease_lost() {
            warn!(operation = operation.as_str(), partition = %partition, "lease lost");
            metrics::counter!(LEASE_LOST).increment(1);
            return;
        }
        error!(
            operation = operation.as_str(),
            partition = %partition,
            error = %error,
            "change feed processor error"
        );
        metrics::counter!(PROCESSOR_ERRORS, "operation" => operation.as_str()).increment(1);
    }
}
