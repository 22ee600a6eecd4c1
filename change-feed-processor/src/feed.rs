//! The monitored data source, as seen by the processor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// Where a partition without a stored continuation starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedPosition {
    Beginning,
    Now,
    PointInTime(DateTime<Utc>),
    /// Resume from a continuation obtained elsewhere.
    Continuation(String),
}

/// A key range of the monitored feed. After a split, `parents` names the
/// range(s) it was carved out of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub id: String,
    pub min_key: String,
    pub max_key: String,
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    /// Resume point after this page. `None` leaves the cursor where it was.
    pub continuation: Option<String>,
    /// The partition no longer exists; its children hold the rest of its log.
    pub is_gone: bool,
    /// Log position of the newest change in the partition, when known.
    pub tail_position: Option<i64>,
}

#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn enumerate_partition_ranges(&self) -> Result<Vec<PartitionRange>>;

    /// Read the next page of `partition_token` starting at `position`.
    ///
    /// A `page_size` of 0 is a metadata probe: no items, but `tail_position`
    /// should be filled in.
    async fn read_changes(
        &self,
        partition_token: &str,
        position: &FeedPosition,
        page_size: usize,
    ) -> Result<Page>;
}
