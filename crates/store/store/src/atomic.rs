//! Named atomic operations.
//!
//! Each [`AtomicOp`] variant is a small read-modify-write program over one or
//! more keys that a backend must execute with no interleaving from other
//! clients. The contract of every variant is documented on the variant; the
//! Redis backend encodes it as a Lua script, the in-memory backend as a single
//! critical section.

use std::time::Duration;

use crate::store::ListEnd;

/// Revision of the atomic operation contracts. Bumped whenever a variant's
/// keys, arguments or reply change meaning.
pub const ATOMIC_OPS_VERSION: u32 = 1;

/// Reply value returned by scripts and transaction commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl Reply {
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Integer value, parsing textual integers.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
            Self::Nil | Self::List(_) => None,
        }
    }

    /// `true` for a non-zero integer, any text, or a list.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Int(n) => *n != 0,
            Self::Text(_) | Self::List(_) => true,
        }
    }

    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(n) => Some(n.to_string()),
            Self::Nil | Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn into_list(self) -> Vec<String> {
        match self {
            Self::List(items) => items,
            Self::Text(s) => vec![s],
            Self::Int(n) => vec![n.to_string()],
            Self::Nil => Vec::new(),
        }
    }
}

/// Physical list holding shard `index` of the sharded queue `queue`.
#[must_use]
pub fn shard_key(queue: &str, index: i64) -> String {
    format!("{queue}:{index}")
}

/// Pointer key recording the shard index currently serving `end` of `queue`.
#[must_use]
pub fn shard_pointer_key(queue: &str, end: ListEnd) -> String {
    match end {
        ListEnd::Head => format!("{queue}:first"),
        ListEnd::Tail => format!("{queue}:last"),
    }
}

/// A named atomic multi-key operation.
///
/// Timestamps are milliseconds since the Unix epoch, supplied by the caller so
/// that the operation itself never reads a clock.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicOp {
    /// If `key` is absent, set it to `token` with expiry `lease`.
    ///
    /// Replies `Int(1)` when set, `Int(0)` when the key already existed.
    AcquireLock {
        key: String,
        token: String,
        lease: Duration,
    },

    /// If `key` holds `token`, delete it.
    ///
    /// Replies `Int(1)` when deleted, `Int(0)` otherwise.
    ReleaseLock { key: String, token: String },

    /// Counting semaphore acquisition on the timestamp set `key`:
    /// remove members scored below `cutoff_ms`, add `token` at `now_ms`,
    /// and keep it only if its rank is below `limit`.
    ///
    /// Replies `Text(token)` when granted, `Nil` when denied.
    AcquireSemaphore {
        key: String,
        token: String,
        limit: u64,
        now_ms: i64,
        cutoff_ms: i64,
    },

    /// Re-score `token` in `key` at `now_ms` if it is still a member.
    ///
    /// Replies `Int(1)` when refreshed, `Int(0)` when the token is gone.
    RefreshSemaphore {
        key: String,
        token: String,
        now_ms: i64,
    },

    /// Fair semaphore acquisition:
    /// 1. remove members of `key` scored below `cutoff_ms`;
    /// 2. intersect `owner_key` with `key`, keeping the ticket scores;
    /// 3. take the next ticket from `counter_key`;
    /// 4. add `token` to `key` at `now_ms` and to `owner_key` at its ticket;
    /// 5. grant if the rank of `token` in `owner_key` is below `limit`,
    ///    otherwise remove it from both sets.
    ///
    /// Replies `Text(token)` when granted, `Nil` when denied.
    AcquireFairSemaphore {
        key: String,
        owner_key: String,
        counter_key: String,
        token: String,
        limit: u64,
        now_ms: i64,
        cutoff_ms: i64,
    },

    /// Remove `token` from both `key` and `owner_key`.
    ///
    /// Replies `Int(n)` where `n` is the removal count from `key`.
    ReleaseFairSemaphore {
        key: String,
        owner_key: String,
        token: String,
    },

    /// If `token` is present in both `key` and `owner_key`, re-score it in
    /// `key` at `now_ms`. Otherwise remove any partial entry from both sets.
    ///
    /// Replies `Int(1)` when refreshed, `Int(0)` when the slot was lost.
    RefreshFairSemaphore {
        key: String,
        owner_key: String,
        token: String,
        now_ms: i64,
    },

    /// Push `items` onto `end` of the sharded queue `queue`.
    ///
    /// Reads the pointer for `end` (default `0`). While no item fits, moves the
    /// pointer one shard away from the other end (decrement for `Head`,
    /// increment for `Tail`). Pushes at most `chunk_size - len - 1` items into
    /// the first shard with room.
    ///
    /// Replies `Int(pushed)`; `Int(0)` if `items` is empty or `chunk_size < 2`.
    ShardedPush {
        queue: String,
        end: ListEnd,
        chunk_size: u64,
        items: Vec<String>,
    },

    /// Pop one item from `end` of the sharded queue `queue`.
    ///
    /// If the pointed shard is empty after the pop and is not the shard
    /// pointed to by the other end, the pointer moves one shard toward the
    /// other end; if the first pop returned nothing, one pop is retried on the
    /// new shard.
    ///
    /// Replies `Text(item)` or `Nil`.
    ShardedPop { queue: String, end: ListEnd },

    /// If the pointer for `end` of `queue` no longer equals `observed`, push
    /// `marker` onto `end` of shard `observed` so that a blocking pop waiting
    /// on that stale shard wakes up.
    ///
    /// Replies `Int(1)` when a marker was pushed, `Int(0)` otherwise.
    ShardedPopNudge {
        queue: String,
        end: ListEnd,
        observed: i64,
        marker: String,
    },
}

impl AtomicOp {
    /// Stable operation name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AcquireLock { .. } => "acquire_lock",
            Self::ReleaseLock { .. } => "release_lock",
            Self::AcquireSemaphore { .. } => "acquire_semaphore",
            Self::RefreshSemaphore { .. } => "refresh_semaphore",
            Self::AcquireFairSemaphore { .. } => "acquire_fair_semaphore",
            Self::ReleaseFairSemaphore { .. } => "release_fair_semaphore",
            Self::RefreshFairSemaphore { .. } => "refresh_fair_semaphore",
            Self::ShardedPush { .. } => "sharded_push",
            Self::ShardedPop { .. } => "sharded_pop",
            Self::ShardedPopNudge { .. } => "sharded_pop_nudge",
        }
    }

    /// Contract revision; see [`ATOMIC_OPS_VERSION`].
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn version(&self) -> u32 {
        ATOMIC_OPS_VERSION
    }
}

impl std::fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name(), self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_conversions() {
        assert_eq!(Reply::Int(3).as_int(), Some(3));
        assert_eq!(Reply::Text("12".into()).as_int(), Some(12));
        assert_eq!(Reply::Nil.as_int(), None);
        assert!(!Reply::Int(0).is_truthy());
        assert!(Reply::Text(String::new()).is_truthy());
        assert_eq!(Reply::Nil.into_list(), Vec::<String>::new());
        assert_eq!(Reply::Text("a".into()).into_text().as_deref(), Some("a"));
    }

    #[test]
    fn shard_layout() {
        assert_eq!(shard_key("jobs", 0), "jobs:0");
        assert_eq!(shard_key("jobs", -2), "jobs:-2");
        assert_eq!(shard_pointer_key("jobs", ListEnd::Head), "jobs:first");
        assert_eq!(shard_pointer_key("jobs", ListEnd::Tail), "jobs:last");
    }

    #[test]
    fn display_includes_version() {
        let op = AtomicOp::ReleaseLock {
            key: "lock:a".into(),
            token: "t".into(),
        };
        assert_eq!(op.to_string(), "release_lock@v1");
    }
}
