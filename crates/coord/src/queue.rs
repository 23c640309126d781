//! Lists split across fixed-capacity shards.
//!
//! Shard `i` of queue `q` is the list `q:i`. The keys `q:first` and `q:last`
//! point at the shards currently serving the head and the tail; head pushes
//! walk the head pointer downwards (possibly below zero) and tail pushes walk
//! the tail pointer upwards. Pops walk each pointer back toward the other.
//!
//! Ordering across shards is exact for sequential callers. Under concurrent
//! pushes and blocking pops it is best-effort: a blocked popper waits on the
//! shard it last saw and may take an item from there after the pointer moved.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use kvsync_store::atomic::{shard_key, shard_pointer_key};
use kvsync_store::{AtomicOp, KvStore, ListEnd};

use crate::config::QueueConfig;
use crate::error::CoordError;

/// Item pushed into a stale shard to wake poppers blocked on it. Never
/// returned to callers.
pub const NUDGE_MARKER: &str = "kvsync:nudge:8d5b0f2e-4c1a-4f0e-9a57-3b1e6c2d7f90";

#[derive(Clone)]
pub struct ShardedQueue {
    store: Arc<dyn KvStore>,
    config: QueueConfig,
}

impl ShardedQueue {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            config: QueueConfig::default(),
        }
    }

    /// Build a queue with explicit settings.
    ///
    /// Rejects a `chunk_size` below 2 (a shard could never hold an item), an
    /// empty `push_batch` and a zero `blocking_slice_ms`, which the store
    /// would read as an unbounded wait.
    pub fn with_config(store: Arc<dyn KvStore>, config: QueueConfig) -> Result<Self, CoordError> {
        if config.chunk_size < 2 {
            return Err(CoordError::InvalidArgument(format!(
                "chunk size must be at least 2, got {}",
                config.chunk_size
            )));
        }
        if config.push_batch == 0 {
            return Err(CoordError::InvalidArgument("push batch must not be empty".into()));
        }
        if config.blocking_slice_ms == 0 {
            return Err(CoordError::InvalidArgument("blocking slice must be positive".into()));
        }
        Ok(Self { store, config })
    }

    /// Push `items` onto `end` of `key`, spilling into new shards as needed.
    ///
    /// Items go in order, so after a tail push the last item is the new tail
    /// and after a head push the last item is the new head. Returns the
    /// number of items pushed.
    #[instrument(name = "queue.push", skip(self, items), fields(queue = %key, %end, count = items.len()))]
    pub async fn push(&self, key: &str, end: ListEnd, items: &[&str]) -> Result<u64, CoordError> {
        let mut total = 0u64;
        for batch in items.chunks(self.config.push_batch) {
            let mut remaining = batch;
            while !remaining.is_empty() {
                let reply = self
                    .store
                    .run_script(&AtomicOp::ShardedPush {
                        queue: key.to_owned(),
                        end,
                        chunk_size: self.config.chunk_size,
                        items: remaining.iter().map(|item| (*item).to_owned()).collect(),
                    })
                    .await?;
                let pushed = reply
                    .as_int()
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(0)
                    .min(remaining.len());
                if pushed == 0 {
                    warn!(left = remaining.len(), "sharded push made no progress");
                    return Ok(total);
                }
                remaining = &remaining[pushed..];
                total += pushed as u64;
            }
        }
        Ok(total)
    }

    pub async fn push_head(&self, key: &str, items: &[&str]) -> Result<u64, CoordError> {
        self.push(key, ListEnd::Head, items).await
    }

    pub async fn push_tail(&self, key: &str, items: &[&str]) -> Result<u64, CoordError> {
        self.push(key, ListEnd::Tail, items).await
    }

    /// Pop one item from `end`, or `None` if the queue is empty.
    pub async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<String>, CoordError> {
        let op = AtomicOp::ShardedPop {
            queue: key.to_owned(),
            end,
        };
        loop {
            match self.store.run_script(&op).await?.into_text() {
                Some(item) if item == NUDGE_MARKER => debug!(queue = %key, "discarded nudge marker"),
                other => return Ok(other),
            }
        }
    }

    /// Pop from `end`, waiting up to `timeout` for an item to arrive.
    ///
    /// A zero `timeout` waits indefinitely. Each round waits at most one
    /// blocking slice on the shard the pointer referenced, after nudging any
    /// shard a previous round may still be blocked on.
    #[instrument(name = "queue.blocking_pop", skip(self), fields(queue = %key, %end))]
    pub async fn blocking_pop(
        &self,
        key: &str,
        end: ListEnd,
        timeout: std::time::Duration,
    ) -> Result<Option<String>, CoordError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let slice = self.config.blocking_slice();
        let pointer = shard_pointer_key(key, end);
        loop {
            if let Some(item) = self.pop(key, end).await? {
                return Ok(Some(item));
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    slice.min(deadline - now)
                }
                None => slice,
            };
            // A zero wait means "forever" to the store.
            if wait.is_zero() {
                continue;
            }

            let observed = self
                .store
                .get(&pointer)
                .await?
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            self.store
                .run_script(&AtomicOp::ShardedPopNudge {
                    queue: key.to_owned(),
                    end,
                    observed,
                    marker: NUDGE_MARKER.to_owned(),
                })
                .await?;

            let shard = shard_key(key, observed);
            if let Some((_, item)) = self.store.blocking_pop(&[shard.as_str()], end, wait).await? {
                if item != NUDGE_MARKER {
                    return Ok(Some(item));
                }
            }
        }
    }

    /// Total number of items across the live shards.
    ///
    /// A nudge marker left behind in a shard is counted until a pop discards
    /// it, so this can over-count while blocking poppers are active. Markers
    /// also take up shard capacity, so a shard can spill early.
    pub async fn len(&self, key: &str) -> Result<u64, CoordError> {
        let first = self.pointer(key, ListEnd::Head).await?;
        let last = self.pointer(key, ListEnd::Tail).await?;
        let mut total = 0;
        for index in first.min(last)..=first.max(last) {
            total += self.store.llen(&shard_key(key, index)).await?;
        }
        Ok(total)
    }

    pub async fn is_empty(&self, key: &str) -> Result<bool, CoordError> {
        Ok(self.len(key).await? == 0)
    }

    async fn pointer(&self, key: &str, end: ListEnd) -> Result<i64, CoordError> {
        Ok(self
            .store
            .get(&shard_pointer_key(key, end))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kvsync_store_memory::MemoryStore;

    use super::*;

    fn queue(chunk_size: u64, push_batch: usize) -> (MemoryStore, ShardedQueue) {
        let store = MemoryStore::new();
        let config = QueueConfig {
            chunk_size,
            push_batch,
            ..QueueConfig::default()
        };
        let queue = ShardedQueue::with_config(Arc::new(store.clone()), config).unwrap();
        (store, queue)
    }

    async fn drain(queue: &ShardedQueue, end: ListEnd) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(item) = queue.pop("q", end).await.unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn tiny_chunks_are_rejected() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let config = QueueConfig {
            chunk_size: 1,
            ..QueueConfig::default()
        };
        assert!(matches!(
            ShardedQueue::with_config(store, config),
            Err(CoordError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_blocking_slice_is_rejected() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let config = QueueConfig {
            blocking_slice_ms: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(
            ShardedQueue::with_config(store, config),
            Err(CoordError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn tail_push_head_pop_is_fifo_across_shards() {
        let (store, queue) = queue(3, 64);
        let items = ["a", "b", "c", "d", "e"];
        assert_eq!(queue.push_tail("q", &items).await.unwrap(), 5);
        // Two items per shard.
        assert_eq!(store.llen("q:0").await.unwrap(), 2);
        assert_eq!(store.llen("q:2").await.unwrap(), 1);
        assert_eq!(queue.len("q").await.unwrap(), 5);

        assert_eq!(drain(&queue, ListEnd::Head).await, items);
        assert!(queue.is_empty("q").await.unwrap());
    }

    #[tokio::test]
    async fn head_push_tail_pop_is_fifo_across_shards() {
        let (store, queue) = queue(3, 2);
        let items = ["1", "2", "3", "4", "5"];
        assert_eq!(queue.push_head("q", &items).await.unwrap(), 5);
        assert_eq!(store.get("q:first").await.unwrap().as_deref(), Some("-2"));

        assert_eq!(drain(&queue, ListEnd::Tail).await, items);
    }

    #[tokio::test]
    async fn same_end_pop_is_lifo() {
        let (_, queue) = queue(3, 64);
        queue.push_tail("q", &["a", "b", "c"]).await.unwrap();
        assert_eq!(drain(&queue, ListEnd::Tail).await, ["c", "b", "a"]);
    }

    #[tokio::test]
    async fn pop_skips_nudge_markers() {
        let (store, queue) = queue(8, 64);
        store.push("q:0", ListEnd::Tail, &[NUDGE_MARKER, "real"]).await.unwrap();
        assert_eq!(queue.pop("q", ListEnd::Head).await.unwrap().as_deref(), Some("real"));
        assert!(queue.pop("q", ListEnd::Head).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_pop_times_out_on_empty_queue() {
        let (_, queue) = queue(8, 64);
        let start = Instant::now();
        let item = queue
            .blocking_pop("q", ListEnd::Head, Duration::from_millis(2_500))
            .await
            .unwrap();
        assert!(item.is_none());
        assert!(start.elapsed() >= Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn blocking_pop_receives_a_later_push() {
        let (store, queue) = queue(8, 64);
        let pusher = {
            let queue = ShardedQueue::new(Arc::new(store));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.push_tail("q", &["late"]).await
            })
        };
        let item = queue
            .blocking_pop("q", ListEnd::Head, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(item.as_deref(), Some("late"));
        assert_eq!(pusher.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn blocking_pop_returns_ready_items_immediately() {
        let (_, queue) = queue(3, 64);
        queue.push_tail("q", &["x", "y", "z"]).await.unwrap();
        for expected in ["x", "y", "z"] {
            let item = queue
                .blocking_pop("q", ListEnd::Head, Duration::from_millis(10))
                .await
                .unwrap();
            assert_eq!(item.as_deref(), Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_slices_still_honour_the_deadline() {
        let store = MemoryStore::new();
        let config = QueueConfig {
            blocking_slice_ms: 1,
            ..QueueConfig::default()
        };
        let queue = ShardedQueue::with_config(Arc::new(store), config).unwrap();
        let item = tokio::time::timeout(
            Duration::from_secs(2),
            queue.blocking_pop("q", ListEnd::Head, Duration::from_millis(50)),
        )
        .await
        .expect("blocking pop should return at its deadline")
        .unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn len_counts_markers_until_popped() {
        let (store, queue) = queue(8, 64);
        queue.push_tail("q", &["real"]).await.unwrap();
        store.push("q:0", ListEnd::Head, &[NUDGE_MARKER]).await.unwrap();
        assert_eq!(queue.len("q").await.unwrap(), 2);

        assert_eq!(queue.pop("q", ListEnd::Head).await.unwrap().as_deref(), Some("real"));
        assert_eq!(queue.len("q").await.unwrap(), 0);
        assert!(queue.is_empty("q").await.unwrap());
    }
}
