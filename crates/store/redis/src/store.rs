use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{FromRedisValue, Script};
use tracing::debug;

use kvsync_store::atomic::{AtomicOp, Reply};
use kvsync_store::error::StoreError;
use kvsync_store::store::{KeyTtl, KvStore, ListEnd, SetOp};
use kvsync_store::tx::{Command, WatchSession};

use crate::config::RedisConfig;
use crate::key_render::{render_key, strip_key};
use crate::scripts;
use crate::tx::{RedisWatchSession, exec_replies, queue_commands};

pub(crate) fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn set_store_command(op: SetOp) -> &'static str {
    match op {
        SetOp::Intersect => "SINTERSTORE",
        SetOp::Union => "SUNIONSTORE",
        SetOp::Difference => "SDIFFSTORE",
    }
}

/// Score bound argument, spelling infinities the way Redis expects.
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_owned()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        score.to_string()
    }
}

/// Convert a raw server reply into a [`Reply`].
pub(crate) fn to_reply(value: redis::Value) -> Result<Reply, StoreError> {
    match value {
        redis::Value::Nil => Ok(Reply::Nil),
        redis::Value::Int(n) => Ok(Reply::Int(n)),
        redis::Value::Okay => Ok(Reply::Text("OK".to_owned())),
        redis::Value::SimpleString(s) => Ok(Reply::Text(s)),
        redis::Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(Reply::Text)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        redis::Value::Array(items) => items
            .into_iter()
            .map(|item| match to_reply(item)? {
                Reply::Text(s) => Ok(s),
                Reply::Int(n) => Ok(n.to_string()),
                other => Err(StoreError::Backend(format!(
                    "unexpected nested reply {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Reply::List),
        other => Err(StoreError::Backend(format!("unsupported reply {other:?}"))),
    }
}

/// Script source, keys and arguments encoding one [`AtomicOp`].
fn encode_op(prefix: &str, op: &AtomicOp) -> (&'static str, Vec<String>, Vec<String>) {
    let key = |k: &str| render_key(prefix, k);
    match op {
        AtomicOp::AcquireLock { key: k, token, lease } => (
            scripts::ACQUIRE_LOCK,
            vec![key(k)],
            vec![token.clone(), duration_ms(*lease).max(1).to_string()],
        ),
        AtomicOp::ReleaseLock { key: k, token } => {
            (scripts::RELEASE_LOCK, vec![key(k)], vec![token.clone()])
        }
        AtomicOp::AcquireSemaphore {
            key: k,
            token,
            limit,
            now_ms,
            cutoff_ms,
        } => (
            scripts::ACQUIRE_SEMAPHORE,
            vec![key(k)],
            vec![
                token.clone(),
                limit.to_string(),
                now_ms.to_string(),
                cutoff_ms.to_string(),
            ],
        ),
        AtomicOp::RefreshSemaphore {
            key: k,
            token,
            now_ms,
        } => (
            scripts::REFRESH_SEMAPHORE,
            vec![key(k)],
            vec![token.clone(), now_ms.to_string()],
        ),
        AtomicOp::AcquireFairSemaphore {
            key: k,
            owner_key,
            counter_key,
            token,
            limit,
            now_ms,
            cutoff_ms,
        } => (
            scripts::ACQUIRE_FAIR_SEMAPHORE,
            vec![key(k), key(owner_key), key(counter_key)],
            vec![
                token.clone(),
                limit.to_string(),
                now_ms.to_string(),
                cutoff_ms.to_string(),
            ],
        ),
        AtomicOp::ReleaseFairSemaphore {
            key: k,
            owner_key,
            token,
        } => (
            scripts::RELEASE_FAIR_SEMAPHORE,
            vec![key(k), key(owner_key)],
            vec![token.clone()],
        ),
        AtomicOp::RefreshFairSemaphore {
            key: k,
            owner_key,
            token,
            now_ms,
        } => (
            scripts::REFRESH_FAIR_SEMAPHORE,
            vec![key(k), key(owner_key)],
            vec![token.clone(), now_ms.to_string()],
        ),
        AtomicOp::ShardedPush {
            queue,
            end,
            chunk_size,
            items,
        } => {
            let mut args = vec![end.as_str().to_owned(), chunk_size.to_string()];
            args.extend(items.iter().cloned());
            (scripts::SHARDED_PUSH, vec![key(queue)], args)
        }
        AtomicOp::ShardedPop { queue, end } => (
            scripts::SHARDED_POP,
            vec![key(queue)],
            vec![end.as_str().to_owned()],
        ),
        AtomicOp::ShardedPopNudge {
            queue,
            end,
            observed,
            marker,
        } => (
            scripts::SHARDED_POP_NUDGE,
            vec![key(queue)],
            vec![end.as_str().to_owned(), observed.to_string(), marker.clone()],
        ),
    }
}

/// Redis-backed implementation of [`KvStore`].
///
/// Uses a `deadpool-redis` connection pool. Plain operations borrow a
/// connection for one command; watch sessions and blocking pops keep theirs
/// until they finish. Atomic operations run as Lua scripts.
pub struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    /// Create a new `RedisStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        render_key(&self.prefix, key)
    }

    fn keys(&self, keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| self.key(k)).collect()
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn().await?;
        cmd.query_async(&mut conn).await.map_err(backend)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("GET").arg(self.key(key))).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(duration_ms(ttl).max(1));
        }
        self.query::<()>(&cmd).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.query(redis::cmd("SETNX").arg(self.key(key)).arg(value))
            .await
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(self.keys(keys))).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.query(
            redis::cmd("PEXPIRE")
                .arg(self.key(key))
                .arg(duration_ms(ttl).max(1)),
        )
        .await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let ms: i64 = self.query(redis::cmd("PTTL").arg(self.key(key))).await?;
        Ok(match ms {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
        })
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.query(redis::cmd("INCRBY").arg(self.key(key)).arg(by))
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let added: i64 = self
            .query(redis::cmd("ZADD").arg(self.key(key)).arg(score).arg(member))
            .await?;
        Ok(added == 1)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.query(redis::cmd("ZSCORE").arg(self.key(key)).arg(member))
            .await
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        self.query(redis::cmd("ZRANK").arg(self.key(key)).arg(member))
            .await
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("ZREM").arg(self.key(key)).arg(members))
            .await
    }

    async fn zrange_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.query(
            redis::cmd("ZRANGE")
                .arg(self.key(key))
                .arg(start)
                .arg(stop)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(self.key(key))
                .arg(score_arg(min))
                .arg(score_arg(max))
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.query(
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(self.key(key))
                .arg(score_arg(min))
                .arg(score_arg(max)),
        )
        .await
    }

    async fn zrem_range_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<u64, StoreError> {
        self.query(
            redis::cmd("ZREMRANGEBYRANK")
                .arg(self.key(key))
                .arg(start)
                .arg(stop),
        )
        .await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("ZCARD").arg(self.key(key))).await
    }

    async fn sadd(&self, key: &str, members: &[&str]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("SADD").arg(self.key(key)).arg(members))
            .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(self.key(key))).await?;
        members.sort();
        Ok(members)
    }

    async fn set_op_store(&self, op: SetOp, dest: &str, keys: &[&str]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            self.delete(&[dest]).await?;
            return Ok(0);
        }
        self.query(
            redis::cmd(set_store_command(op))
                .arg(self.key(dest))
                .arg(self.keys(keys)),
        )
            .await
    }

    async fn push(&self, key: &str, end: ListEnd, items: &[&str]) -> Result<u64, StoreError> {
        if items.is_empty() {
            return self.llen(key).await;
        }
        let name = match end {
            ListEnd::Head => "LPUSH",
            ListEnd::Tail => "RPUSH",
        };
        self.query(redis::cmd(name).arg(self.key(key)).arg(items))
            .await
    }

    async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<String>, StoreError> {
        let name = match end {
            ListEnd::Head => "LPOP",
            ListEnd::Tail => "RPOP",
        };
        self.query(redis::cmd(name).arg(self.key(key))).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("LLEN").arg(self.key(key))).await
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
        let name = match end {
            ListEnd::Head => "BLPOP",
            ListEnd::Tail => "BRPOP",
        };
        // The server rounds to milliseconds and reads 0 as "forever".
        let seconds = if timeout.is_zero() {
            0.0
        } else {
            timeout.max(Duration::from_millis(1)).as_secs_f64()
        };
        let popped: Option<(String, String)> = self
            .query(redis::cmd(name).arg(self.keys(keys)).arg(seconds))
            .await?;
        if popped.is_none() {
            debug!(?keys, "blocking pop timed out");
        }
        Ok(popped.map(|(key, value)| (strip_key(&self.prefix, &key).to_owned(), value)))
    }

    async fn watch(&self, keys: &[&str]) -> Result<Box<dyn WatchSession>, StoreError> {
        let mut conn = self.conn().await?;
        if !keys.is_empty() {
            redis::cmd("WATCH")
                .arg(self.keys(keys))
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend)?;
        }
        Ok(Box::new(RedisWatchSession::new(conn, self.prefix.clone())))
    }

    async fn multi_exec(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let pipe = queue_commands(&self.prefix, &commands)?;
        let mut conn = self.conn().await?;
        let raw: redis::Value = pipe.query_async(&mut conn).await.map_err(backend)?;
        exec_replies(raw)?.ok_or_else(|| {
            StoreError::Backend("unwatched transaction reported an abort".into())
        })
    }

    async fn run_script(&self, op: &AtomicOp) -> Result<Reply, StoreError> {
        let (source, keys, args) = encode_op(&self.prefix, op);
        let script = Script::new(source);
        let mut invocation = script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        for arg in &args {
            invocation.arg(arg);
        }
        let mut conn = self.conn().await?;
        let raw: redis::Value = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        to_reply(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_bounds_use_redis_spelling() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(2.5), "2.5");
    }

    #[test]
    fn replies_convert_from_wire_values() {
        assert_eq!(to_reply(redis::Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(to_reply(redis::Value::Okay).unwrap(), Reply::Text("OK".into()));
        assert_eq!(
            to_reply(redis::Value::Array(vec![
                redis::Value::BulkString(b"a".to_vec()),
                redis::Value::Int(2),
            ]))
            .unwrap(),
            Reply::List(vec!["a".into(), "2".into()])
        );
    }

    #[test]
    fn ops_are_encoded_with_prefixed_keys() {
        let (source, keys, args) = encode_op(
            "p",
            &AtomicOp::AcquireFairSemaphore {
                key: "sem".into(),
                owner_key: "sem:owner".into(),
                counter_key: "sem:counter".into(),
                token: "t".into(),
                limit: 3,
                now_ms: 100,
                cutoff_ms: 40,
            },
        );
        assert_eq!(source, scripts::ACQUIRE_FAIR_SEMAPHORE);
        assert_eq!(keys, ["p:sem", "p:sem:owner", "p:sem:counter"]);
        assert_eq!(args, ["t", "3", "100", "40"]);
    }

    #[test]
    fn zero_lease_is_clamped_for_px() {
        let (_, _, args) = encode_op(
            "",
            &AtomicOp::AcquireLock {
                key: "lock:x".into(),
                token: "t".into(),
                lease: Duration::ZERO,
            },
        );
        assert_eq!(args, ["t", "1"]);
    }
}
