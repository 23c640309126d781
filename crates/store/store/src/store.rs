use std::time::Duration;

use async_trait::async_trait;

use crate::atomic::{AtomicOp, Reply};
use crate::error::StoreError;
use crate::tx::{Command, WatchSession};

/// Which end of a list an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListEnd {
    /// The left end (`LPUSH` / `LPOP`).
    Head,
    /// The right end (`RPUSH` / `RPOP`).
    Tail,
}

impl ListEnd {
    /// The other end of the list.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Head => Self::Tail,
            Self::Tail => Self::Head,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Tail => "tail",
        }
    }
}

impl std::fmt::Display for ListEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set-combination operation stored into a destination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOp {
    Intersect,
    Union,
    Difference,
}

impl SetOp {
    /// All operations, in a stable order.
    pub const ALL: [Self; 3] = [Self::Intersect, Self::Union, Self::Difference];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intersect => "intersect",
            Self::Union => "union",
            Self::Difference => "difference",
        }
    }
}

impl std::fmt::Display for SetOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key exists and expires after the given duration.
    Expires(Duration),
}

/// The capability interface the coordination layer consumes.
///
/// Every method is a single round trip against a shared store and is atomic
/// with respect to other clients. Multi-step atomicity is available through
/// [`KvStore::watch`], [`KvStore::multi_exec`] and [`KvStore::run_script`].
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a string value. Returns `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a string value, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set a string value only if the key does not exist.
    /// Returns `true` if the key was newly set.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Delete keys of any type. Returns how many existed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError>;

    /// Set an expiry on an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Atomically add `by` to an integer value, creating it at 0 first.
    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    /// Add or update a sorted-set member. Returns `true` if it was newly added.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Zero-based rank of a member, ordered by score then member bytes.
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError>;

    /// Remove members. Returns how many were present.
    async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64, StoreError>;

    /// Members with ranks in `start..=stop`; negative indexes count from the end.
    async fn zrange_by_rank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Members with scores in `min..=max`, in rank order.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Remove members with scores in `min..=max`. Returns how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// Remove members with ranks in `start..=stop`. Returns how many were removed.
    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64)
    -> Result<u64, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Add members to an unordered set. Returns how many were new.
    async fn sadd(&self, key: &str, members: &[&str]) -> Result<u64, StoreError>;

    /// All members of an unordered set, sorted for deterministic output.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Combine the sets at `keys` with `op` and store the result at `dest`.
    /// Returns the cardinality of the stored result.
    async fn set_op_store(&self, op: SetOp, dest: &str, keys: &[&str]) -> Result<u64, StoreError>;

    /// Push items onto one end of a list, in argument order.
    /// Returns the new length.
    async fn push(&self, key: &str, end: ListEnd, items: &[&str]) -> Result<u64, StoreError>;

    /// Pop one item from one end of a list.
    async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<String>, StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    /// Pop from the first non-empty list in `keys`, waiting up to `timeout`.
    /// `Duration::ZERO` waits indefinitely. Returns `(key, value)`.
    async fn blocking_pop(
        &self,
        keys: &[&str],
        end: ListEnd,
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Start an optimistic transaction watching `keys`.
    async fn watch(&self, keys: &[&str]) -> Result<Box<dyn WatchSession>, StoreError>;

    /// Execute commands as one atomic unit without watching any key.
    async fn multi_exec(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError>;

    /// Execute a named atomic operation with no interleaving from other clients.
    async fn run_script(&self, op: &AtomicOp) -> Result<Reply, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_dyn_kv_store(_: &dyn KvStore) {}

    #[test]
    fn list_end_opposite() {
        assert_eq!(ListEnd::Head.opposite(), ListEnd::Tail);
        assert_eq!(ListEnd::Tail.opposite(), ListEnd::Head);
    }

    #[test]
    fn set_op_names() {
        let names: Vec<&str> = SetOp::ALL.iter().map(|op| op.as_str()).collect();
        assert_eq!(names, ["intersect", "union", "difference"]);
    }
}
