use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::continuation::FeedContinuation;
use crate::error::Result;
use crate::feed::{ChangeFeedSource, FeedPosition};
use crate::lease::{Lease, LeaseContainer};
use crate::metrics_consts::ESTIMATED_LAG;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseWorkEstimate {
    pub lease_token: String,
    pub owner: Option<String>,
    /// Changes written after the lease's continuation. Never negative; 1
    /// when the exact gap cannot be told.
    pub estimated_lag: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstimatedWork {
    pub leases: Vec<LeaseWorkEstimate>,
    pub total: u64,
}

/// Read-only view of how far behind each lease is.
///
/// Each lease gets a zero-item probe read at its continuation; the feed
/// reports its tail position and the estimate is the distance to it. A lease
/// whose probe fails is logged and left out of the result; one whose
/// continuation carries no readable position counts as lag 1.
pub struct RemainingWorkEstimator {
    container: Arc<LeaseContainer>,
    source: Arc<dyn ChangeFeedSource>,
    degree_of_parallelism: usize,
}

impl RemainingWorkEstimator {
    pub fn new(
        container: Arc<LeaseContainer>,
        source: Arc<dyn ChangeFeedSource>,
        degree_of_parallelism: usize,
    ) -> Self {
        Self {
            container,
            source,
            degree_of_parallelism: degree_of_parallelism.max(1),
        }
    }

    pub async fn estimate(&self) -> Result<EstimatedWork> {
        let leases = self.container.all_leases().await?;

        let estimates: Vec<Option<LeaseWorkEstimate>> = stream::iter(leases)
            .map(|lease| async move {
                match self.estimate_lease(&lease).await {
                    Ok(lag) => Some(LeaseWorkEstimate {
                        lease_token: lease.partition_token,
                        owner: lease.owner,
                        estimated_lag: lag,
                    }),
                    Err(e) => {
                        warn!(
                            partition = %lease.partition_token,
                            error = %e,
                            "failed to estimate remaining work"
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.degree_of_parallelism)
            .collect()
            .await;

        let mut leases: Vec<LeaseWorkEstimate> = estimates.into_iter().flatten().collect();
        leases.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
        for estimate in &leases {
            metrics::gauge!(ESTIMATED_LAG, "lease" => estimate.lease_token.clone())
                .set(estimate.estimated_lag as f64);
        }
        let total = leases.iter().map(|l| l.estimated_lag).sum();
        Ok(EstimatedWork { leases, total })
    }

    pub async fn estimate_total(&self) -> Result<u64> {
        Ok(self.estimate().await?.total)
    }

    async fn estimate_lease(&self, lease: &Lease) -> Result<u64> {
        let position = match &lease.continuation_token {
            Some(c) => FeedPosition::Continuation(c.clone()),
            None => FeedPosition::Beginning,
        };
        let probe = self
            .source
            .read_changes(&lease.partition_token, &position, 0)
            .await?;

        let last = match &lease.continuation_token {
            Some(c) => match FeedContinuation::parse(c) {
                Ok(token) => Some(token.position()),
                Err(e) => {
                    debug!(partition = %lease.partition_token, error = %e, "opaque continuation");
                    None
                }
            },
            None => None,
        };
        Ok(remaining(probe.tail_position, last))
    }
}

fn remaining(tail: Option<i64>, last_processed: Option<i64>) -> u64 {
    match (tail, last_processed) {
        (Some(tail), Some(last)) => u64::try_from(tail.saturating_sub(last)).unwrap_or(0),
        _ => 1,
    }
}
