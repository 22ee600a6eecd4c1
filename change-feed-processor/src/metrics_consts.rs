// ==== Lease ownership metrics ====
/// Counter for leases this worker acquired
pub const LEASE_ACQUIRED: &str = "change_feed_lease_acquired_total";

/// Counter for leases this worker released voluntarily
pub const LEASE_RELEASED: &str = "change_feed_lease_released_total";

/// Counter for leases taken away from this worker (stolen, expired, deleted)
pub const LEASE_LOST: &str = "change_feed_lease_lost_total";

/// Gauge for leases currently supervised on this worker
pub const OWNED_LEASES: &str = "change_feed_owned_leases";

// ==== Processing metrics ====
/// Counter for changes handed to the observer
pub const CHANGES_PROCESSED: &str = "change_feed_changes_processed_total";

/// Counter for observer callbacks that failed
pub const OBSERVER_ERRORS: &str = "change_feed_observer_errors_total";

/// Counter for checkpoints written
pub const CHECKPOINTS: &str = "change_feed_checkpoints_total";

/// Counter for partition splits handled
pub const PARTITION_SPLITS: &str = "change_feed_partition_splits_total";

/// Counter for errors reported to the health monitor, labelled by `operation`
pub const PROCESSOR_ERRORS: &str = "change_feed_processor_errors_total";

// ==== Balancing metrics ====
/// Counter for load balancing passes
pub const BALANCING_PASSES: &str = "change_feed_balancing_passes_total";

// ==== Estimator metrics ====
/// Gauge for estimated pending changes per lease
pub const ESTIMATED_LAG: &str = "change_feed_estimated_lag";
