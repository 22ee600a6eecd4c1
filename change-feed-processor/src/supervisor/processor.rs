use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checkpointer::Checkpointer;
use crate::config::{CheckpointFrequency, ProcessorOptions};
use crate::error::{Error, Result};
use crate::feed::{ChangeFeedSource, FeedPosition};
use crate::metrics_consts::{CHANGES_PROCESSED, OBSERVER_ERRORS};
use crate::observer::{ChangeFeedContext, ChangeFeedObserver};

/// Drains one partition's change feed into an observer.
///
/// Progress only moves after the observer returned successfully: the
/// in-memory cursor first, then (per [`CheckpointFrequency`]) the lease.
pub(crate) struct FeedProcessor {
    source: Arc<dyn ChangeFeedSource>,
    checkpointer: Arc<Checkpointer>,
    options: ProcessorOptions,
    partition: String,
    position: FeedPosition,
    /// Last continuation whose changes the observer has fully handled.
    continuation: Option<String>,
    pending_items: usize,
    last_checkpoint: Instant,
}

impl FeedProcessor {
    pub(crate) fn new(
        source: Arc<dyn ChangeFeedSource>,
        checkpointer: Arc<Checkpointer>,
        options: ProcessorOptions,
        partition: String,
        continuation: Option<String>,
    ) -> Self {
        let position = match &continuation {
            Some(c) => FeedPosition::Continuation(c.clone()),
            None => options.start_from.clone(),
        };
        Self {
            source,
            checkpointer,
            options,
            partition,
            position,
            continuation,
            pending_items: 0,
            last_checkpoint: Instant::now(),
        }
    }

    fn gone(&self) -> Error {
        Error::PartitionGone {
            partition: self.partition.clone(),
            continuation: self.continuation.clone(),
        }
    }

    fn advance(&mut self, continuation: Option<String>) {
        if let Some(c) = continuation {
            self.position = FeedPosition::Continuation(c.clone());
            self.continuation = Some(c);
        }
    }

    /// Returns `Ok(())` once `cancel` fires; anything else that ends
    /// processing is an error.
    pub(crate) async fn run(
        &mut self,
        observer: &mut dyn ChangeFeedObserver,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = self.source.read_changes(
                    &self.partition,
                    &self.position,
                    self.options.max_item_count,
                ) => read,
            };

            let page = match read {
                Ok(page) => page,
                Err(e) if e.is_partition_gone() => return Err(self.gone()),
                Err(e) if e.is_transient() => {
                    warn!(partition = %self.partition, error = %e, "transient read failure, retrying");
                    if !self.wait(cancel).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if page.is_gone {
                return Err(self.gone());
            }

            if page.items.is_empty() {
                debug!(partition = %self.partition, "no new changes");
                self.advance(page.continuation);
                if !self.wait(cancel).await {
                    return Ok(());
                }
                continue;
            }

            let count = page.items.len();
            let ctx = ChangeFeedContext::new(
                self.partition.clone(),
                page.continuation.clone(),
                self.checkpointer.clone(),
            );
            if let Err(e) = observer.process_changes(&ctx, page.items, cancel).await {
                metrics::counter!(OBSERVER_ERRORS).increment(1);
                return Err(Error::Observer {
                    partition: self.partition.clone(),
                    reason: format!("{e:#}"),
                });
            }
            metrics::counter!(CHANGES_PROCESSED).increment(count as u64);

            self.advance(page.continuation);
            self.pending_items += count;
            self.maybe_checkpoint().await?;
        }
    }

    async fn maybe_checkpoint(&mut self) -> Result<()> {
        let due = match self.options.checkpoint_frequency {
            CheckpointFrequency::EveryBatch => true,
            CheckpointFrequency::ItemCount(n) => self.pending_items >= n,
            CheckpointFrequency::Interval(every) => self.last_checkpoint.elapsed() >= every,
            CheckpointFrequency::Explicit => false,
        };
        let Some(continuation) = self.continuation.as_deref() else {
            return Ok(());
        };
        if !due {
            return Ok(());
        }

        self.checkpointer.checkpoint(continuation).await?;
        self.pending_items = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }

    /// Sleep for the poll delay. `false` if cancelled meanwhile.
    async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.options.feed_poll_delay) => true,
        }
    }
}
