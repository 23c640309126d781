use async_trait::async_trait;
use tracing::debug;

use kvsync_store::atomic::Reply;
use kvsync_store::error::StoreError;
use kvsync_store::store::ListEnd;
use kvsync_store::tx::{Command, TxResult, WatchSession};

use crate::key_render::render_key;
use crate::store::{backend, duration_ms, set_store_command, to_reply};

/// Build a `MULTI`/`EXEC` pipeline for `commands`.
pub(crate) fn queue_commands(
    prefix: &str,
    commands: &[Command],
) -> Result<redis::Pipeline, StoreError> {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in commands {
        command.validate()?;
        match command {
            Command::Set { key, value, ttl } => {
                pipe.cmd("SET").arg(render_key(prefix, key)).arg(value);
                if let Some(ttl) = ttl {
                    pipe.arg("PX").arg(duration_ms(*ttl).max(1));
                }
            }
            Command::Delete { keys } => {
                let keys: Vec<String> = keys.iter().map(|k| render_key(prefix, k)).collect();
                pipe.cmd("DEL").arg(keys);
            }
            Command::Increment { key, by } => {
                pipe.cmd("INCRBY").arg(render_key(prefix, key)).arg(*by);
            }
            Command::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE")
                    .arg(render_key(prefix, key))
                    .arg(duration_ms(*ttl).max(1));
            }
            Command::ZAdd { key, member, score } => {
                pipe.cmd("ZADD")
                    .arg(render_key(prefix, key))
                    .arg(*score)
                    .arg(member);
            }
            Command::ZRem { key, members } => {
                pipe.cmd("ZREM").arg(render_key(prefix, key)).arg(members);
            }
            Command::ZRange { key, start, stop } => {
                pipe.cmd("ZRANGE")
                    .arg(render_key(prefix, key))
                    .arg(*start)
                    .arg(*stop);
            }
            Command::Push { key, end, items } => {
                let name = match end {
                    ListEnd::Head => "LPUSH",
                    ListEnd::Tail => "RPUSH",
                };
                pipe.cmd(name).arg(render_key(prefix, key)).arg(items);
            }
            Command::SetStore { op, dest, keys } => {
                let keys: Vec<String> = keys.iter().map(|k| render_key(prefix, k)).collect();
                pipe.cmd(set_store_command(*op))
                    .arg(render_key(prefix, dest))
                    .arg(keys);
            }
        }
    }
    Ok(pipe)
}

/// Per-command replies of an `EXEC`, or `None` when the server aborted the
/// transaction because a watched key changed.
pub(crate) fn exec_replies(raw: redis::Value) -> Result<Option<Vec<Reply>>, StoreError> {
    match raw {
        redis::Value::Nil => Ok(None),
        redis::Value::Array(items) => items
            .into_iter()
            .map(to_reply)
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        other => Err(StoreError::Backend(format!(
            "unexpected EXEC reply {other:?}"
        ))),
    }
}

/// Optimistic transaction on a dedicated pooled connection.
///
/// `WATCH` state lives on the connection, so the session keeps it for its
/// whole life. A session dropped without `exec` or `unwatch` detaches the
/// connection from the pool instead of handing a watching connection to the
/// next caller.
pub(crate) struct RedisWatchSession {
    conn: Option<deadpool_redis::Connection>,
    prefix: String,
}

impl RedisWatchSession {
    pub(crate) fn new(conn: deadpool_redis::Connection, prefix: String) -> Self {
        Self {
            conn: Some(conn),
            prefix,
        }
    }

    fn conn(&mut self) -> Result<&mut deadpool_redis::Connection, StoreError> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::Connection("watch session already closed".into()))
    }

    /// Hand the connection back to the pool.
    fn release(&mut self) {
        drop(self.conn.take());
    }

    async fn query<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let conn = self.conn()?;
        cmd.query_async(conn).await.map_err(backend)
    }
}

impl Drop for RedisWatchSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(deadpool_redis::Connection::take(conn));
        }
    }
}

#[async_trait]
impl WatchSession for RedisWatchSession {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let key = render_key(&self.prefix, key);
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn zrank(&mut self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        let key = render_key(&self.prefix, key);
        self.query(redis::cmd("ZRANK").arg(key).arg(member)).await
    }

    async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let key = render_key(&self.prefix, key);
        self.query(redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn exec(self: Box<Self>, commands: Vec<Command>) -> Result<TxResult, StoreError> {
        let mut this = self;
        let raw: redis::Value = if commands.is_empty() {
            this.query::<()>(&redis::cmd("MULTI")).await?;
            this.query(&redis::cmd("EXEC")).await?
        } else {
            let pipe = queue_commands(&this.prefix, &commands)?;
            pipe.query_async(this.conn()?).await.map_err(backend)?
        };
        // EXEC clears the watch either way, so the connection is reusable.
        this.release();
        match exec_replies(raw)? {
            Some(replies) => Ok(TxResult::Committed(replies)),
            None => {
                debug!("watched key changed, transaction aborted");
                Ok(TxResult::Conflict)
            }
        }
    }

    async fn unwatch(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.query::<()>(&redis::cmd("UNWATCH")).await?;
        this.release();
        Ok(())
    }
}
