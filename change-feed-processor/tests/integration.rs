mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use change_feed_processor::continuation::FeedContinuation;
use change_feed_processor::lease::LeaseManager;
use change_feed_processor::store::InMemoryStore;

use common::{
    builder, init_tracing, leases, owned_count, owners, recording_processor, seen, seen_set,
    wait_for_condition, MemoryFeed, PREFIX, POLL_INTERVAL, WAIT_TIMEOUT,
};

const PARTITIONS: [&str; 4] = ["0", "1", "2", "3"];

fn store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

async fn wait_for_all_seen(feed: &Arc<MemoryFeed>, seen: &common::Seen) {
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, move || async move {
        seen_set(seen).await == feed.appended()
    })
    .await;
}

#[tokio::test]
async fn single_worker_processes_and_checkpoints_every_partition() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&PARTITIONS);
    for p in PARTITIONS {
        feed.append(p, 5);
    }
    let seen = seen();

    let worker = recording_processor(&store, &feed, "worker-0", &seen);
    worker.start().await.unwrap();
    wait_for_all_seen(&feed, &seen).await;

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move {
            leases(&store).await.iter().all(|lease| {
                lease
                    .continuation_token
                    .as_deref()
                    .and_then(|c| FeedContinuation::parse(c).ok())
                    .is_some_and(|c| c.position() > 0)
            })
        }
    })
    .await;

    assert_eq!(owned_count(&store, "worker-0").await, PARTITIONS.len());
    assert_eq!(worker.owned_partitions().unwrap().len(), PARTITIONS.len());

    worker.stop().await.unwrap();
    assert!(
        owners(&store).await.values().all(Option::is_none),
        "a stopped worker gives its leases back"
    );
}

#[tokio::test]
async fn two_workers_split_partitions_evenly() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&PARTITIONS);
    let seen = seen();

    let a = recording_processor(&store, &feed, "worker-a", &seen);
    a.start().await.unwrap();

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move { owned_count(&store, "worker-a").await == PARTITIONS.len() }
    })
    .await;

    let b = recording_processor(&store, &feed, "worker-b", &seen);
    b.start().await.unwrap();

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move {
            owned_count(&store, "worker-a").await == 2 && owned_count(&store, "worker-b").await == 2
        }
    })
    .await;

    for p in PARTITIONS {
        feed.append(p, 3);
    }
    wait_for_all_seen(&feed, &seen).await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn leases_of_a_crashed_worker_are_taken_over_after_expiry() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&PARTITIONS);
    for p in PARTITIONS {
        feed.append(p, 2);
    }

    // A worker that grabs every lease and then never renews.
    let ghost = LeaseManager::new(store.clone(), PREFIX.to_string(), "ghost".to_string());
    for p in PARTITIONS {
        let lease = ghost.create_lease_if_not_exist(p, None).await.unwrap().unwrap();
        ghost.acquire(&lease).await.unwrap();
    }

    let seen = seen();
    let survivor = recording_processor(&store, &feed, "survivor", &seen);
    survivor.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        owned_count(&store, "ghost").await,
        PARTITIONS.len(),
        "live leases are never stolen"
    );

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move { owned_count(&store, "survivor").await == PARTITIONS.len() }
    })
    .await;
    wait_for_all_seen(&feed, &seen).await;

    survivor.stop().await.unwrap();
}

#[tokio::test]
async fn graceful_stop_hands_leases_to_the_remaining_worker() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&PARTITIONS);
    let seen = seen();

    let a = recording_processor(&store, &feed, "worker-a", &seen);
    let b = recording_processor(&store, &feed, "worker-b", &seen);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move {
            owned_count(&store, "worker-a").await == 2 && owned_count(&store, "worker-b").await == 2
        }
    })
    .await;

    a.stop().await.unwrap();
    assert_eq!(owned_count(&store, "worker-a").await, 0);
    assert!(a.owned_partitions().unwrap().is_empty());

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move { owned_count(&store, "worker-b").await == PARTITIONS.len() }
    })
    .await;

    for p in PARTITIONS {
        feed.append(p, 4);
    }
    wait_for_all_seen(&feed, &seen).await;

    b.stop().await.unwrap();
}

#[tokio::test]
async fn split_partition_resumes_in_children_without_gaps_or_replays() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&["0", "1"]);
    feed.append("0", 5);
    feed.append("1", 5);
    let seen = seen();

    let worker = recording_processor(&store, &feed, "worker-0", &seen);
    worker.start().await.unwrap();
    wait_for_all_seen(&feed, &seen).await;

    feed.append("0", 3);
    feed.split("0", &["2", "3"]);
    feed.append("2", 2);
    feed.append("3", 2);

    wait_for_all_seen(&feed, &seen).await;

    let check_store = Arc::clone(&store);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        async move {
            let owners = owners(&store).await;
            owners.keys().map(String::as_str).collect::<Vec<_>>() == ["1", "2", "3"]
                && owners.values().all(|o| o.as_deref() == Some("worker-0"))
        }
    })
    .await;

    let delivered = seen.lock().await.clone();
    let unique: BTreeSet<i64> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), unique.len(), "no change delivered twice");
    assert!(feed.enumerations() >= 2, "the split re-read the topology");

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn failed_batches_are_never_checkpointed() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&["0", "1"]);
    feed.append("0", 3);
    let healthy_tail = *feed.append("1", 3).last().unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let worker = builder(&store, &feed)
        .with_instance_name("worker-0")
        .with_handler(move |changes, _cancel| {
            let counter = Arc::clone(&counter);
            async move {
                if changes.iter().any(|c| c["partition"] == "0") {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("poison batch");
                }
                Ok(())
            }
        })
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let check_store = Arc::clone(&store);
    let check_failures = Arc::clone(&failures);
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let store = Arc::clone(&check_store);
        let failures = Arc::clone(&check_failures);
        async move {
            let healthy_done = leases(&store).await.iter().any(|lease| {
                lease.partition_token == "1"
                    && lease
                        .continuation_token
                        .as_deref()
                        .and_then(|c| FeedContinuation::parse(c).ok())
                        .is_some_and(|c| c.position() == healthy_tail)
            });
            // Retried after the lease was released and picked up again.
            healthy_done && failures.load(Ordering::SeqCst) >= 2
        }
    })
    .await;

    let poisoned = leases(&store)
        .await
        .into_iter()
        .find(|lease| lease.partition_token == "0")
        .unwrap();
    assert_eq!(poisoned.continuation_token, None);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn racing_workers_bootstrap_the_lease_store_once() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&["0", "1", "2", "3", "4", "5"]);
    let seen = seen();

    let workers: Vec<_> = (0..4)
        .map(|i| recording_processor(&store, &feed, &format!("worker-{i}"), &seen))
        .collect();
    let started = join_all(workers.iter().map(|w| w.start())).await;
    assert!(started.iter().all(Result::is_ok));

    assert_eq!(feed.enumerations(), 1);
    assert_eq!(leases(&store).await.len(), 6);

    for worker in &workers {
        worker.stop().await.unwrap();
    }
}

#[tokio::test]
async fn concurrent_acquire_has_exactly_one_winner() {
    let store = store();
    let managers: Vec<_> = (0..8)
        .map(|i| LeaseManager::new(store.clone(), PREFIX.to_string(), format!("worker-{i}")))
        .collect();

    let created = join_all(
        managers
            .iter()
            .map(|m| m.create_lease_if_not_exist("0", None)),
    )
    .await;
    let winners = created
        .into_iter()
        .filter(|r| matches!(r, Ok(Some(_))))
        .count();
    assert_eq!(winners, 1, "exactly one create succeeds");

    let lease = managers[0].read("0").await.unwrap().unwrap();
    let acquired = join_all(managers.iter().map(|m| m.acquire(&lease))).await;

    let won: Vec<_> = acquired.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 1);
    assert!(acquired
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_lease_lost()));

    let stored = managers[0].read("0").await.unwrap().unwrap();
    assert_eq!(stored.owner, won[0].owner);
}

#[tokio::test]
async fn estimator_reports_remaining_work_per_lease() {
    init_tracing();
    let store = store();
    let feed = MemoryFeed::new(&["0", "1"]);
    feed.append("0", 4);
    feed.append("1", 4);
    let seen = seen();

    let worker = recording_processor(&store, &feed, "worker-0", &seen);
    worker.start().await.unwrap();
    let estimator = builder(&store, &feed).build_estimator().unwrap();

    let check = &estimator;
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, move || async move {
        check.estimate_total().await.ok() == Some(0)
    })
    .await;
    worker.stop().await.unwrap();

    feed.append("0", 3);
    let work = estimator.estimate().await.unwrap();
    assert_eq!(work.leases.len(), 2);
    assert_eq!(work.leases[0].lease_token, "0");
    assert!(work.leases[0].estimated_lag >= 3);
    assert_eq!(work.leases[1].estimated_lag, 0);
    assert_eq!(work.total, work.leases[0].estimated_lag);
    assert!(work.leases.iter().all(|l| l.owner.is_none()));
}

#[tokio::test]
async fn stopped_processor_cannot_be_restarted() {
    let store = store();
    let feed = MemoryFeed::new(&["0"]);
    let worker = recording_processor(&store, &feed, "worker-0", &seen());

    worker.start().await.unwrap();
    assert!(worker.start().await.is_err(), "already running");
    worker.stop().await.unwrap();
    assert!(worker.start().await.is_err());
}

#[tokio::test]
async fn builder_rejects_incomplete_configuration() {
    let store = store();
    let feed = MemoryFeed::new(&["0"]);

    let no_handler = builder(&store, &feed).with_instance_name("w").build();
    assert!(no_handler.is_err());

    let no_name = builder(&store, &feed)
        .with_handler(|_, _| async { Ok(()) })
        .build();
    assert!(no_name.is_err());
}
