use std::time::Duration;

use async_trait::async_trait;

use crate::atomic::Reply;
use crate::error::StoreError;
use crate::store::{ListEnd, SetOp};

/// A command queued inside a transaction.
///
/// Commands are applied in order when the transaction commits; each one
/// produces one [`Reply`] in the committed result.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `SET key value [PX ttl]`. Replies `Text("OK")`.
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// `DEL keys...`. Replies `Int(removed)`.
    Delete { keys: Vec<String> },
    /// `INCRBY key by`. Replies `Int(new value)`.
    Increment { key: String, by: i64 },
    /// `PEXPIRE key ttl`. Replies `Int(1)` if the key exists, else `Int(0)`.
    Expire { key: String, ttl: Duration },
    /// `ZADD key score member`. Replies `Int(1)` if newly added.
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// `ZREM key members...`. Replies `Int(removed)`.
    ZRem { key: String, members: Vec<String> },
    /// `ZRANGE key start stop`. Replies `List(members)`.
    ZRange { key: String, start: i64, stop: i64 },
    /// `LPUSH`/`RPUSH`. Replies `Int(new length)`.
    Push {
        key: String,
        end: ListEnd,
        items: Vec<String>,
    },
    /// `SINTERSTORE`/`SUNIONSTORE`/`SDIFFSTORE`. Replies `Int(cardinality)`.
    SetStore {
        op: SetOp,
        dest: String,
        keys: Vec<String>,
    },
}

impl Command {
    /// Reject commands that name no keys, members or items. Redis refuses
    /// them and every backend must behave the same way.
    pub fn validate(&self) -> Result<(), StoreError> {
        let empty = match self {
            Self::Delete { keys } => keys.is_empty(),
            Self::ZRem { members, .. } => members.is_empty(),
            Self::Push { items, .. } => items.is_empty(),
            Self::SetStore { keys, .. } => keys.is_empty(),
            Self::Set { .. }
            | Self::Increment { .. }
            | Self::Expire { .. }
            | Self::ZAdd { .. }
            | Self::ZRange { .. } => false,
        };
        if empty {
            return Err(StoreError::InvalidArgument(format!(
                "{self:?} has nothing to operate on"
            )));
        }
        Ok(())
    }
}

/// Outcome of committing a watched transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxResult {
    /// Every queued command was applied; one reply per command.
    Committed(Vec<Reply>),
    /// A watched key changed after `watch`; nothing was applied.
    Conflict,
}

impl TxResult {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// An open optimistic transaction.
///
/// Reads go straight to the store. [`WatchSession::exec`] applies the queued
/// commands only if none of the watched keys changed since the session was
/// opened. Dropping a session without calling `exec` or `unwatch` abandons
/// the watch.
#[async_trait]
pub trait WatchSession: Send {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    async fn zrank(&mut self, key: &str, member: &str) -> Result<Option<u64>, StoreError>;

    async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Commit `commands` atomically if the watched keys are unchanged.
    async fn exec(self: Box<Self>, commands: Vec<Command>) -> Result<TxResult, StoreError>;

    /// Abandon the transaction without applying anything.
    async fn unwatch(self: Box<Self>) -> Result<(), StoreError>;
}
