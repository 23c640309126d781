//! End-to-end coordination scenarios.
//!
//! Each test models several independent clients sharing one store; every
//! client gets its own handle onto the same in-memory keyspace.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kvsync_coord::{
    AutocompleteIndex, CoordError, Dispatch, FairSemaphore, LockManager, ManualClock,
    Semaphore, ShardedQueue, TaskHandler, WorkerBuilder,
};
use kvsync_coord::config::{QueueConfig, SemaphoreConfig, WorkerConfig};
use kvsync_coord::clock::Clock;
use kvsync_coord::delayed::DelayedQueue;
use kvsync_store::{KvStore, ListEnd};
use kvsync_store_memory::MemoryStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn client(store: &MemoryStore) -> Arc<dyn KvStore> {
    Arc::new(store.clone())
}

// -- Locks --

mod locks {
    use super::*;

    #[tokio::test]
    async fn inventory_lock() {
        init_tracing();
        let store = MemoryStore::new();
        let alice = LockManager::new(client(&store));
        let bob = LockManager::new(client(&store));
        let lease = Duration::from_secs(10);

        let token = alice
            .acquire("inventory", Duration::from_secs(1), lease)
            .await
            .expect("acquire")
            .expect("lock should be free");
        assert!(
            bob.acquire("inventory", Duration::ZERO, lease)
                .await
                .expect("acquire")
                .is_none()
        );

        assert!(alice.release("inventory", &token).await.expect("release"));
        assert!(!alice.release("inventory", &token).await.expect("release"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mutual_exclusion_under_contention() {
        init_tracing();
        let store = MemoryStore::new();
        let inside = Arc::new(AtomicU32::new(0));
        let entered = Arc::new(AtomicU32::new(0));

        let clients: Vec<_> = (0..8)
            .map(|_| {
                let locks = LockManager::new(client(&store));
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                tokio::spawn(async move {
                    for _ in 0..5 {
                        let result: Result<Option<()>, CoordError> = locks
                            .with_lock("market", Duration::from_secs(10), Duration::from_secs(10), || async {
                                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                                tokio::time::sleep(Duration::from_millis(1)).await;
                                inside.fetch_sub(1, Ordering::SeqCst);
                                entered.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .await;
                        assert!(result.expect("with_lock").is_some());
                    }
                })
            })
            .collect();
        for handle in clients {
            handle.await.expect("client task");
        }
        assert_eq!(entered.load(Ordering::SeqCst), 40);
    }
}

// -- Semaphores --

mod semaphores {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn fair(store: &MemoryStore, clock: &Arc<ManualClock>) -> FairSemaphore {
        FairSemaphore::with_clock(
            client(store),
            Arc::clone(clock) as Arc<dyn Clock>,
            SemaphoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn fair_semaphore_hands_over_a_released_slot() {
        init_tracing();
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (x, y, z) = (fair(&store, &clock), fair(&store, &clock), fair(&store, &clock));

        let x_token = x.acquire("sem", 2, TIMEOUT).await.expect("x").expect("x granted");
        let y_token = y.acquire("sem", 2, TIMEOUT).await.expect("y").expect("y granted");
        assert!(z.acquire("sem", 2, TIMEOUT).await.expect("z").is_none());

        assert!(x.release("sem", &x_token).await.expect("release"));
        let z_token = z.acquire("sem", 2, TIMEOUT).await.expect("z").expect("z granted");

        assert!(store.zscore("sem:owner", &y_token).await.expect("zscore").is_some());
        assert!(store.zscore("sem:owner", &z_token).await.expect("zscore").is_some());
        assert!(store.zscore("sem:owner", &x_token).await.expect("zscore").is_none());
        assert_eq!(store.zcard("sem:owner").await.expect("zcard"), 2);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        init_tracing();
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let sem = Semaphore::with_clock(
            client(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            SemaphoreConfig::default(),
        );

        let mut granted = 0;
        for _ in 0..10 {
            if sem.acquire("pool", 3, TIMEOUT).await.expect("acquire").is_some() {
                granted += 1;
            }
            clock.advance_ms(1);
        }
        assert_eq!(granted, 3);
        assert_eq!(store.zcard("pool").await.expect("zcard"), 3);
    }

    #[tokio::test]
    async fn fair_semaphore_survives_clock_skew() {
        init_tracing();
        let store = MemoryStore::new();
        let fast = Arc::new(ManualClock::new(10_000));
        let slow = Arc::new(ManualClock::new(9_000));
        let early = fair(&store, &fast);
        let late = fair(&store, &slow);

        let first = early.acquire("sem", 1, TIMEOUT).await.expect("acquire");
        assert!(first.is_some());
        // A lagging clock gives the later arrival an older timestamp, but its
        // ticket still ranks behind.
        assert!(late.acquire("sem", 1, TIMEOUT).await.expect("acquire").is_none());

        let unfair = Semaphore::with_clock(
            client(&store),
            Arc::clone(&slow) as Arc<dyn Clock>,
            SemaphoreConfig::default(),
        );
        let unfair_early = Semaphore::with_clock(
            client(&store),
            Arc::clone(&fast) as Arc<dyn Clock>,
            SemaphoreConfig::default(),
        );
        let holder = unfair_early.acquire("plain", 1, TIMEOUT).await.expect("acquire");
        assert!(holder.is_some());
        // Without tickets the lagging client jumps the line.
        assert!(unfair.acquire("plain", 1, TIMEOUT).await.expect("acquire").is_some());
    }
}

// -- Queues --

mod queues {
    use super::*;

    #[tokio::test]
    async fn producers_and_consumer_share_a_sharded_queue() {
        init_tracing();
        let store = MemoryStore::new();
        let config = QueueConfig {
            chunk_size: 4,
            push_batch: 5,
            ..QueueConfig::default()
        };
        let producer = ShardedQueue::with_config(client(&store), config.clone()).expect("queue");
        let consumer = ShardedQueue::with_config(client(&store), config).expect("queue");

        let items: Vec<String> = (0..20).map(|n| format!("item-{n}")).collect();
        let refs: Vec<&str> = items.iter().map(String::as_str).collect();
        assert_eq!(producer.push_tail("work", &refs).await.expect("push"), 20);
        assert_eq!(consumer.len("work").await.expect("len"), 20);

        let mut popped = Vec::new();
        while let Some(item) = consumer
            .blocking_pop("work", ListEnd::Head, Duration::from_millis(10))
            .await
            .expect("pop")
        {
            popped.push(item);
        }
        assert_eq!(popped, items);
    }
}

// -- Autocomplete --

mod autocomplete {
    use super::*;

    #[tokio::test]
    async fn members_join_and_are_suggested() {
        init_tracing();
        let store = MemoryStore::new();
        let writer = AutocompleteIndex::new(client(&store));
        let reader = AutocompleteIndex::new(client(&store));
        for name in ["alice", "alex", "alfred", "bob", "albert"] {
            writer.join("rustaceans", name).await.expect("join");
        }

        assert_eq!(
            reader.autocomplete("rustaceans", "al").await.expect("lookup"),
            ["albert", "alex", "alfred", "alice"]
        );
        assert_eq!(
            reader.autocomplete("rustaceans", "ale").await.expect("lookup"),
            ["alex"]
        );
        assert_eq!(store.zcard("members:rustaceans").await.expect("zcard"), 5);
    }
}

// -- Scheduled work --

mod scheduled {
    use kvsync_coord::config::DelayedConfig;

    use super::*;

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl TaskHandler for Counter {
        async fn handle(&self, args: serde_json::Value) -> Result<(), CoordError> {
            let by = args.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(1);
            self.0.fetch_add(by, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_tasks_reach_the_worker_when_due() {
        init_tracing();
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(50_000));
        let delayed = DelayedQueue::with_config(
            client(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            QueueConfig::default(),
            DelayedConfig::default(),
        )
        .expect("delayed queue");
        let total = Arc::new(AtomicU32::new(0));
        let (worker, _shutdown) = WorkerBuilder::new(client(&store), "billing")
            .config(WorkerConfig {
                pop_timeout_ms: 20,
                ..WorkerConfig::default()
            })
            .handler("charge", Arc::new(Counter(Arc::clone(&total))))
            .build()
            .expect("worker");

        delayed
            .schedule("billing", "charge", serde_json::json!(5), Duration::from_secs(30))
            .await
            .expect("schedule");
        delayed
            .schedule("billing", "charge", serde_json::json!(2), Duration::ZERO)
            .await
            .expect("schedule");

        assert_eq!(
            worker.process_one(Duration::from_millis(20)).await.expect("process"),
            Dispatch::Handled("charge".into())
        );
        assert_eq!(delayed.poll_once().await.expect("poll"), None);
        assert_eq!(
            worker.process_one(Duration::from_millis(20)).await.expect("process"),
            Dispatch::Idle
        );

        clock.advance_ms(30_000);
        assert!(delayed.poll_once().await.expect("poll").is_some());
        assert_eq!(
            worker.process_one(Duration::from_millis(20)).await.expect("process"),
            Dispatch::Handled("charge".into())
        );
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }
}
