use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use kvsync_store::atomic::{AtomicOp, Reply};
use kvsync_store::error::StoreError;
use kvsync_store::store::{KeyTtl, KvStore, ListEnd, SetOp};
use kvsync_store::tx::{Command, WatchSession};

use crate::keyspace::Keyspace;
use crate::script;
use crate::tx::MemoryWatchSession;

#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) keyspace: Mutex<Keyspace>,
    /// Signalled after every write that may have grown a list.
    pub(crate) pushed: Notify,
}

impl Shared {
    pub(crate) fn wake_poppers(&self) {
        self.pushed.notify_waiters();
    }
}

/// In-memory [`KvStore`] for tests and single-process deployments.
///
/// All data lives behind one mutex, so every trait method, script and
/// committed transaction is atomic with respect to every other. Keys with a
/// TTL are evicted lazily on access using the tokio clock, which lets tests
/// drive expiry with `tokio::time::advance`.
///
/// Cloning is cheap and every clone observes the same data, the way several
/// clients of one Redis server would.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Keyspace) -> T) -> T {
        f(&mut self.shared.keyspace.lock())
    }

    fn try_pop_any(
        &self,
        keys: &[&str],
        end: ListEnd,
    ) -> Result<Option<(String, String)>, StoreError> {
        self.with(|ks| {
            for key in keys {
                if let Some(item) = ks.pop(key, end)? {
                    return Ok(Some(((*key).to_owned(), item)));
                }
            }
            Ok(None)
        })
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with(|ks| ks.get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with(|ks| ks.set(key, value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        Ok(self.with(|ks| ks.set_if_absent(key, value)))
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError> {
        Ok(self.with(|ks| ks.delete(keys)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.with(|ks| ks.expire(key, ttl)))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        Ok(self.with(|ks| ks.ttl(key)))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.with(|ks| ks.increment(key, by))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        self.with(|ks| ks.zadd(key, member, score))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.with(|ks| ks.zscore(key, member))
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        self.with(|ks| ks.zrank(key, member))
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64, StoreError> {
        self.with(|ks| ks.zrem(key, members))
    }

    async fn zrange_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.with(|ks| ks.zrange_by_rank(key, start, stop))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.with(|ks| ks.zrange_by_score(key, min, max))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.with(|ks| ks.zrem_where(key, |_, score| score >= min && score <= max))
    }

    async fn zrem_range_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<u64, StoreError> {
        self.with(|ks| ks.zrem_range_by_rank(key, start, stop))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.with(|ks| ks.zcard(key))
    }

    async fn sadd(&self, key: &str, members: &[&str]) -> Result<u64, StoreError> {
        self.with(|ks| ks.sadd(key, members))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with(|ks| ks.smembers(key))
    }

    async fn set_op_store(&self, op: SetOp, dest: &str, keys: &[&str]) -> Result<u64, StoreError> {
        self.with(|ks| ks.set_op_store(op, dest, keys))
    }

    async fn push(&self, key: &str, end: ListEnd, items: &[&str]) -> Result<u64, StoreError> {
        let len = self.with(|ks| ks.push(key, end, items))?;
        self.shared.wake_poppers();
        Ok(len)
    }

    async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<String>, StoreError> {
        self.with(|ks| ks.pop(key, end))
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.with(|ks| ks.llen(key))
    }

    async fn blocking_pop(
        &self,
        keys: &[&str],
        end: ListEnd,
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        if keys.is_empty() {
            return Err(StoreError::InvalidArgument(
                "blocking pop needs at least one key".into(),
            ));
        }
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop_any(keys, end)? {
                return Ok(Some(hit));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(?keys, "blocking pop timed out");
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn watch(&self, keys: &[&str]) -> Result<Box<dyn WatchSession>, StoreError> {
        Ok(Box::new(MemoryWatchSession::new(
            Arc::clone(&self.shared),
            keys,
        )))
    }

    async fn multi_exec(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        commands.iter().try_for_each(Command::validate)?;
        let replies = self.with(|ks| {
            commands
                .iter()
                .map(|command| script::apply(ks, command))
                .collect::<Result<Vec<_>, _>>()
        })?;
        self.shared.wake_poppers();
        Ok(replies)
    }

    async fn run_script(&self, op: &AtomicOp) -> Result<Reply, StoreError> {
        let reply = self.with(|ks| script::run(ks, op))?;
        self.shared.wake_poppers();
        Ok(reply)
    }
}
