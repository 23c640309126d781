//! Tasks that become ready for a worker queue at a later time.
//!
//! Scheduled tasks wait in the ordered set `delayed:` scored by their due time
//! in milliseconds. A poller moves each due task onto the sharded queue
//! `queue:{queue}` while holding a lock named after the task id, so several
//! pollers can run against the same store without moving a task twice.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use kvsync_store::KvStore;

use crate::clock::{Clock, SystemClock};
use crate::config::{DelayedConfig, QueueConfig};
use crate::error::CoordError;
use crate::keys::{DELAYED_KEY, ready_queue_key};
use crate::lock::LockManager;
use crate::queue::ShardedQueue;

type TaskTuple = (String, String, String, serde_json::Value);

/// A task as stored in the store: the JSON array `[id, queue, name, args]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TaskTuple", into = "TaskTuple")]
pub struct DelayedTask {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub args: serde_json::Value,
}

impl From<TaskTuple> for DelayedTask {
    fn from((id, queue, name, args): TaskTuple) -> Self {
        Self {
            id,
            queue,
            name,
            args,
        }
    }
}

impl From<DelayedTask> for TaskTuple {
    fn from(task: DelayedTask) -> Self {
        (task.id, task.queue, task.name, task.args)
    }
}

/// Schedules tasks and moves them to their queue when due.
#[derive(Clone)]
pub struct DelayedQueue {
    store: Arc<dyn KvStore>,
    queue: ShardedQueue,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    config: DelayedConfig,
}

impl DelayedQueue {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let queue = ShardedQueue::new(Arc::clone(&store));
        Self::from_parts(store, queue, Arc::new(SystemClock), DelayedConfig::default())
    }

    /// Build with explicit settings. Fails if `queue_config` is invalid.
    pub fn with_config(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        queue_config: QueueConfig,
        config: DelayedConfig,
    ) -> Result<Self, CoordError> {
        let queue = ShardedQueue::with_config(Arc::clone(&store), queue_config)?;
        Ok(Self::from_parts(store, queue, clock, config))
    }

    fn from_parts(
        store: Arc<dyn KvStore>,
        queue: ShardedQueue,
        clock: Arc<dyn Clock>,
        config: DelayedConfig,
    ) -> Self {
        let locks = LockManager::new(Arc::clone(&store));
        Self {
            store,
            queue,
            locks,
            clock,
            config,
        }
    }

    /// Schedule `name(args)` on `queue` after `delay`, returning the task id.
    ///
    /// A zero delay pushes the task straight onto the ready queue.
    #[instrument(name = "delayed.schedule", skip(self, args), fields(%queue, %name))]
    pub async fn schedule(
        &self,
        queue: &str,
        name: &str,
        args: serde_json::Value,
        delay: Duration,
    ) -> Result<String, CoordError> {
        let task = DelayedTask {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_owned(),
            name: name.to_owned(),
            args,
        };
        let id = task.id.clone();
        let raw = serde_json::to_string(&task)?;
        if delay.is_zero() {
            self.queue.push_tail(&ready_queue_key(queue), &[raw.as_str()]).await?;
        } else {
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            #[allow(clippy::cast_precision_loss)]
            let due = self.clock.now_ms().saturating_add(delay_ms) as f64;
            self.store.zadd(DELAYED_KEY, &raw, due).await?;
        }
        debug!(%id, "task scheduled");
        Ok(id)
    }

    /// Number of tasks still waiting for their due time.
    pub async fn pending(&self) -> Result<u64, CoordError> {
        Ok(self.store.zcard(DELAYED_KEY).await?)
    }

    /// Move the earliest task to its queue if it is due.
    ///
    /// Returns the id of the moved task, or `None` when nothing is due or
    /// another poller holds the task's lock.
    pub async fn poll_once(&self) -> Result<Option<String>, CoordError> {
        let Some((raw, due)) = self
            .store
            .zrange_by_rank(DELAYED_KEY, 0, 0)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        #[allow(clippy::cast_precision_loss)]
        let now = self.clock.now_ms() as f64;
        if due > now {
            return Ok(None);
        }

        let task: DelayedTask = match serde_json::from_str(&raw) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "dropping malformed delayed task");
                self.store.zrem(DELAYED_KEY, &[raw.as_str()]).await?;
                return Ok(None);
            }
        };

        let moved = self
            .locks
            .with_lock(
                &task.id,
                self.config.lock_acquire_timeout(),
                self.config.lock_lease(),
                || async {
                    if self.store.zrem(DELAYED_KEY, &[raw.as_str()]).await? == 0 {
                        return Ok::<_, CoordError>(false);
                    }
                    self.queue
                        .push_tail(&ready_queue_key(&task.queue), &[raw.as_str()])
                        .await?;
                    Ok(true)
                },
            )
            .await?;

        if moved == Some(true) {
            debug!(id = %task.id, queue = %task.queue, "delayed task is ready");
            Ok(Some(task.id))
        } else {
            Ok(None)
        }
    }

    /// A poller running [`Self::poll_once`] in a loop, and the sender that
    /// stops it.
    pub fn poller(&self) -> (DelayedPoller, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let poller = DelayedPoller {
            queue: self.clone(),
            shutdown_rx,
        };
        (poller, shutdown_tx)
    }
}

/// Background loop moving due tasks to their queues.
pub struct DelayedPoller {
    queue: DelayedQueue,
    shutdown_rx: mpsc::Receiver<()>,
}

impl DelayedPoller {
    /// Poll until a shutdown signal arrives or every sender is dropped.
    ///
    /// Polls back to back while tasks are due and sleeps for the configured
    /// interval when idle. A poll in progress always completes.
    pub async fn run(&mut self) {
        info!("delayed task poller starting");
        let idle = self.queue.config.poll_interval();

        loop {
            let moved = match self.queue.poll_once().await {
                Ok(moved) => moved.is_some(),
                Err(e) => {
                    error!(error = %e, "error polling delayed tasks");
                    false
                }
            };

            if moved {
                match self.shutdown_rx.try_recv() {
                    Err(TryRecvError::Empty) => continue,
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                }
            }

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("delayed task poller received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(idle) => {}
            }
        }

        info!("delayed task poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use kvsync_store::ListEnd;
    use kvsync_store_memory::MemoryStore;
    use serde_json::json;

    use crate::clock::ManualClock;

    use super::*;

    fn delayed(clock: &Arc<ManualClock>) -> (MemoryStore, DelayedQueue) {
        let store = MemoryStore::new();
        let queue = DelayedQueue::with_config(
            Arc::new(store.clone()),
            Arc::clone(clock) as Arc<dyn Clock>,
            QueueConfig::default(),
            DelayedConfig::default(),
        )
        .unwrap();
        (store, queue)
    }

    async fn ready(store: &MemoryStore, queue: &str) -> Vec<DelayedTask> {
        let ready = ShardedQueue::new(Arc::new(store.clone()));
        let mut out = Vec::new();
        while let Some(raw) = ready.pop(&ready_queue_key(queue), ListEnd::Head).await.unwrap() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    #[test]
    fn wire_format_is_an_array() {
        let task = DelayedTask {
            id: "id-1".into(),
            queue: "email".into(),
            name: "send".into(),
            args: json!({"to": "a@b"}),
        };
        let raw = serde_json::to_string(&task).unwrap();
        assert_eq!(raw, r#"["id-1","email","send",{"to":"a@b"}]"#);
        assert_eq!(serde_json::from_str::<DelayedTask>(&raw).unwrap(), task);
    }

    #[tokio::test]
    async fn zero_delay_goes_straight_to_the_queue() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, delayed) = delayed(&clock);
        let id = delayed.schedule("email", "send", json!([1]), Duration::ZERO).await.unwrap();
        assert_eq!(delayed.pending().await.unwrap(), 0);
        let tasks = ready(&store, "email").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].name, "send");
    }

    #[tokio::test]
    async fn tasks_move_only_when_due() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, delayed) = delayed(&clock);
        let late = delayed
            .schedule("email", "late", json!(null), Duration::from_secs(5))
            .await
            .unwrap();
        let early = delayed
            .schedule("email", "early", json!(null), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(delayed.poll_once().await.unwrap(), None);
        clock.advance_ms(2_000);
        assert_eq!(delayed.poll_once().await.unwrap(), Some(early));
        assert_eq!(delayed.poll_once().await.unwrap(), None);
        clock.advance_ms(3_000);
        assert_eq!(delayed.poll_once().await.unwrap(), Some(late));
        assert_eq!(delayed.pending().await.unwrap(), 0);

        let names: Vec<_> = ready(&store, "email").await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["early", "late"]);
    }

    #[tokio::test]
    async fn locked_task_is_left_for_its_owner() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, delayed) = delayed(&clock);
        let id = delayed
            .schedule("email", "send", json!(null), Duration::from_millis(1))
            .await
            .unwrap();
        clock.advance_ms(10);

        let locks = LockManager::new(Arc::new(store.clone()));
        let token = locks.try_acquire(&id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(delayed.poll_once().await.unwrap(), None);
        assert_eq!(delayed.pending().await.unwrap(), 1);

        locks.release(&id, &token).await.unwrap();
        assert_eq!(delayed.poll_once().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, delayed) = delayed(&clock);
        store.zadd(DELAYED_KEY, "not json", 0.0).await.unwrap();
        assert_eq!(delayed.poll_once().await.unwrap(), None);
        assert_eq!(delayed.pending().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_moves_tasks_until_shutdown() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, delayed) = delayed(&clock);
        delayed
            .schedule("email", "a", json!(null), Duration::from_millis(500))
            .await
            .unwrap();
        delayed
            .schedule("email", "b", json!(null), Duration::from_millis(600))
            .await
            .unwrap();
        clock.advance_ms(1_000);

        let (mut poller, shutdown) = delayed.poller();
        let handle = tokio::spawn(async move { poller.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).await.unwrap();
        handle.await.unwrap();

        assert_eq!(delayed.pending().await.unwrap(), 0);
        assert_eq!(ready(&store, "email").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_sender_stops_the_poller() {
        let clock = Arc::new(ManualClock::new(0));
        let (_, delayed) = delayed(&clock);
        let (mut poller, shutdown) = delayed.poller();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), poller.run())
            .await
            .expect("poller should stop");
    }
}
