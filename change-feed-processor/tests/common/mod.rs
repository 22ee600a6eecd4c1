#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use change_feed_processor::config::{
    BootstrapOptions, CheckpointFrequency, LeaseOptions, ProcessorOptions,
};
use change_feed_processor::continuation::FeedContinuation;
use change_feed_processor::lease::{Lease, LeaseContainer};
use change_feed_processor::store::InMemoryStore;
use change_feed_processor::{
    ChangeFeedProcessor, ChangeFeedProcessorBuilder, ChangeFeedSource, FeedPosition, Page,
    PartitionRange, Result,
};

pub const PREFIX: &str = "cf";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

// ── Options ─────────────────────────────────────────────────────

pub fn lease_options() -> LeaseOptions {
    LeaseOptions {
        renew_interval: Duration::from_millis(100),
        acquire_interval: Duration::from_millis(150),
        expiration_interval: Duration::from_secs(1),
        prefix: PREFIX.to_string(),
        ..Default::default()
    }
}

pub fn processor_options() -> ProcessorOptions {
    ProcessorOptions {
        feed_poll_delay: Duration::from_millis(20),
        max_item_count: 10,
        start_from: FeedPosition::Beginning,
        checkpoint_frequency: CheckpointFrequency::EveryBatch,
    }
}

pub fn bootstrap_options() -> BootstrapOptions {
    BootstrapOptions {
        lock_time: Duration::from_secs(5),
        sleep_time: Duration::from_millis(50),
    }
}

// ── In-memory feed ──────────────────────────────────────────────

struct PartitionLog {
    parents: Vec<String>,
    entries: Vec<(i64, Value)>,
    gone: bool,
}

impl PartitionLog {
    fn new(parents: Vec<String>) -> Self {
        Self {
            parents,
            entries: Vec::new(),
            gone: false,
        }
    }

    fn tail(&self) -> i64 {
        self.entries.last().map(|(pos, _)| *pos).unwrap_or(0)
    }
}

#[derive(Default)]
struct FeedState {
    next_position: i64,
    partitions: BTreeMap<String, PartitionLog>,
    appended: BTreeSet<i64>,
}

/// A partitioned log. Positions are global and start at 1; each change is
/// `{"partition": .., "seq": position}`. A split hands the parent's entries
/// to its children, keeping their positions, so a child read from the
/// parent's continuation sees exactly what the parent had not delivered yet.
pub struct MemoryFeed {
    state: StdMutex<FeedState>,
    enumerations: AtomicUsize,
}

impl MemoryFeed {
    pub fn new(partitions: &[&str]) -> Arc<Self> {
        let mut state = FeedState::default();
        for id in partitions {
            state
                .partitions
                .insert(id.to_string(), PartitionLog::new(Vec::new()));
        }
        Arc::new(Self {
            state: StdMutex::new(state),
            enumerations: AtomicUsize::new(0),
        })
    }

    /// Append `count` changes to `partition`, returning their positions.
    pub fn append(&self, partition: &str, count: usize) -> Vec<i64> {
        let mut state = self.state.lock().unwrap();
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            state.next_position += 1;
            let position = state.next_position;
            let log = state
                .partitions
                .get_mut(partition)
                .expect("append to unknown partition");
            assert!(!log.gone, "append to a split partition");
            log.entries
                .push((position, json!({ "partition": partition, "seq": position })));
            state.appended.insert(position);
            positions.push(position);
        }
        positions
    }

    pub fn split(&self, parent: &str, children: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let log = state.partitions.get_mut(parent).expect("split unknown partition");
        log.gone = true;
        let entries = std::mem::take(&mut log.entries);

        let mut logs: Vec<PartitionLog> = children
            .iter()
            .map(|_| PartitionLog::new(vec![parent.to_string()]))
            .collect();
        for (i, (position, value)) in entries.into_iter().enumerate() {
            let child = &children[i % children.len()];
            let mut value = value;
            value["partition"] = json!(child);
            logs[i % children.len()].entries.push((position, value));
        }
        for (id, log) in children.iter().zip(logs) {
            state.partitions.insert(id.to_string(), log);
        }
    }

    pub fn appended(&self) -> BTreeSet<i64> {
        self.state.lock().unwrap().appended.clone()
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

fn token(position: i64) -> String {
    FeedContinuation::V1 { position }.to_string()
}

#[async_trait]
impl ChangeFeedSource for MemoryFeed {
    async fn enumerate_partition_ranges(&self) -> Result<Vec<PartitionRange>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state
            .partitions
            .iter()
            .filter(|(_, log)| !log.gone)
            .map(|(id, log)| PartitionRange {
                id: id.clone(),
                min_key: String::new(),
                max_key: String::new(),
                parents: log.parents.clone(),
            })
            .collect())
    }

    async fn read_changes(
        &self,
        partition_token: &str,
        position: &FeedPosition,
        page_size: usize,
    ) -> Result<Page> {
        let state = self.state.lock().unwrap();
        let Some(log) = state.partitions.get(partition_token).filter(|l| !l.gone) else {
            return Ok(Page {
                is_gone: true,
                ..Default::default()
            });
        };

        let after = match position {
            FeedPosition::Beginning | FeedPosition::PointInTime(_) => 0,
            FeedPosition::Now => log.tail(),
            FeedPosition::Continuation(c) => FeedContinuation::parse(c)?.position(),
        };
        let items: Vec<(i64, Value)> = log
            .entries
            .iter()
            .filter(|(pos, _)| *pos > after)
            .take(page_size)
            .cloned()
            .collect();
        let last = items.last().map(|(pos, _)| *pos).unwrap_or(after);

        Ok(Page {
            items: items.into_iter().map(|(_, value)| value).collect(),
            continuation: Some(token(last)),
            is_gone: false,
            tail_position: Some(log.tail()),
        })
    }
}

// ── Processors ──────────────────────────────────────────────────

/// Positions of every change handed to a handler, in delivery order.
pub type Seen = Arc<Mutex<Vec<i64>>>;

pub fn seen() -> Seen {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn builder(store: &Arc<InMemoryStore>, feed: &Arc<MemoryFeed>) -> ChangeFeedProcessorBuilder {
    ChangeFeedProcessorBuilder::new(feed.clone())
        .with_lease_store(store.clone())
        .with_lease_options(lease_options())
        .with_processor_options(processor_options())
        .with_bootstrap_options(bootstrap_options())
}

pub fn recording_processor(
    store: &Arc<InMemoryStore>,
    feed: &Arc<MemoryFeed>,
    name: &str,
    seen: &Seen,
) -> ChangeFeedProcessor {
    let seen = Arc::clone(seen);
    builder(store, feed)
        .with_instance_name(name)
        .with_handler(move |changes, _cancel| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock()
                    .await
                    .extend(changes.iter().filter_map(|c| c["seq"].as_i64()));
                Ok(())
            }
        })
        .build()
        .expect("failed to build processor")
}

// ── Lease inspection ────────────────────────────────────────────

pub async fn leases(store: &Arc<InMemoryStore>) -> Vec<Lease> {
    LeaseContainer::new(store.clone(), PREFIX.to_string())
        .all_leases()
        .await
        .expect("failed to list leases")
}

/// partition token -> owner
pub async fn owners(store: &Arc<InMemoryStore>) -> BTreeMap<String, Option<String>> {
    leases(store)
        .await
        .into_iter()
        .map(|lease| (lease.partition_token, lease.owner))
        .collect()
}

pub async fn owned_count(store: &Arc<InMemoryStore>, worker: &str) -> usize {
    owners(store)
        .await
        .values()
        .filter(|owner| owner.as_deref() == Some(worker))
        .count()
}

pub async fn seen_set(seen: &Seen) -> BTreeSet<i64> {
    seen.lock().await.iter().copied().collect()
}
