use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::feed::ChangeFeedSource;
use crate::lease::{Lease, LeaseContainer, LeaseManager};

/// Reconciles the feed's partition topology with the lease documents.
pub struct PartitionSynchronizer {
    source: Arc<dyn ChangeFeedSource>,
    manager: Arc<LeaseManager>,
    container: Arc<LeaseContainer>,
    degree_of_parallelism: usize,
}

impl PartitionSynchronizer {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        manager: Arc<LeaseManager>,
        container: Arc<LeaseContainer>,
        degree_of_parallelism: usize,
    ) -> Self {
        Self {
            source,
            manager,
            container,
            degree_of_parallelism: degree_of_parallelism.max(1),
        }
    }

    /// Create an unowned lease for every range that has none. Safe to run on
    /// several workers at once: only one create per range succeeds.
    ///
    /// Returns how many leases this call created.
    pub async fn create_missing_leases(&self) -> Result<usize> {
        let ranges = self.source.enumerate_partition_ranges().await?;
        let covered: HashSet<String> = self
            .container
            .all_leases()
            .await?
            .into_iter()
            .map(|lease| lease.partition_token)
            .collect();

        let missing: Vec<String> = ranges
            .into_iter()
            .map(|range| range.id)
            .filter(|id| !covered.contains(id))
            .collect();
        if missing.is_empty() {
            debug!("every partition range already has a lease");
            return Ok(0);
        }

        let manager = &self.manager;
        let results: Vec<Result<Option<Lease>>> = stream::iter(missing)
            .map(|token| async move { manager.create_lease_if_not_exist(&token, None).await })
            .buffer_unordered(self.degree_of_parallelism)
            .collect()
            .await;

        let mut created = 0;
        for result in results {
            if result?.is_some() {
                created += 1;
            }
        }
        info!(created, "created missing leases");
        Ok(created)
    }

    /// Fan `lease` out to the ranges its partition split into.
    ///
    /// Every child lease starts from the parent's continuation. Children that
    /// already have a lease (another worker got there first) are returned as
    /// stored. A split with no visible children fails with
    /// [`Error::SplitWithoutChildren`].
    pub async fn split_partition(&self, lease: &Lease) -> Result<Vec<Lease>> {
        let parent = &lease.partition_token;
        let children: Vec<String> = self
            .source
            .enumerate_partition_ranges()
            .await?
            .into_iter()
            .filter(|range| range.parents.iter().any(|p| p == parent))
            .map(|range| range.id)
            .collect();

        if children.is_empty() {
            return Err(Error::SplitWithoutChildren(parent.clone()));
        }
        info!(
            partition = %parent,
            children = ?children,
            "partition split, creating child leases"
        );

        let manager = &self.manager;
        let continuation = &lease.continuation_token;
        let results: Vec<Result<Lease>> = stream::iter(children)
            .map(|token| async move {
                if let Some(created) = manager
                    .create_lease_if_not_exist(&token, continuation.clone())
                    .await?
                {
                    return Ok(created);
                }
                manager
                    .read(&token)
                    .await?
                    .ok_or_else(|| Error::LeaseLost(token.clone()))
            })
            .buffer_unordered(self.degree_of_parallelism)
            .collect()
            .await;

        results.into_iter().collect()
    }
}
