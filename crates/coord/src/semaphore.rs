//! Counting semaphores with timestamp-based holder expiry.
//!
//! A holder is a token in an ordered set scored by its acquisition (or last
//! refresh) time. Entries older than the caller's `timeout` are purged before
//! each acquisition, so a crashed holder frees its slot after `timeout`.
//!
//! [`Semaphore`] ranks holders by timestamp and therefore trusts every
//! client's clock. [`FairSemaphore`] ranks them by a ticket drawn from a
//! shared counter, so a client with a fast clock cannot jump the line.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use kvsync_store::{AtomicOp, KvStore};

use crate::clock::{Clock, SystemClock};
use crate::config::SemaphoreConfig;
use crate::error::CoordError;
use crate::keys::{counter_key, owner_key};
use crate::lock::LockManager;
use crate::retry::retry_until;

fn check_limit(limit: u64) -> Result<(), CoordError> {
    if limit == 0 {
        return Err(CoordError::InvalidArgument(
            "semaphore limit must be at least 1".into(),
        ));
    }
    Ok(())
}

fn cutoff_ms(now_ms: i64, timeout: Duration) -> i64 {
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(timeout_ms)
}

/// Unfair counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: SemaphoreConfig,
}

impl Semaphore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), SemaphoreConfig::default())
    }

    pub fn with_clock(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: SemaphoreConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Try once to take one of `limit` slots of `semname`.
    ///
    /// Holders idle for longer than `timeout` are dropped first. Returns the
    /// holder token when granted.
    #[instrument(name = "semaphore.acquire", skip(self), fields(semaphore = %semname))]
    pub async fn acquire(
        &self,
        semname: &str,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<String>, CoordError> {
        check_limit(limit)?;
        let now_ms = self.clock.now_ms();
        let reply = self
            .store
            .run_script(&AtomicOp::AcquireSemaphore {
                key: semname.to_owned(),
                token: Uuid::new_v4().to_string(),
                limit,
                now_ms,
                cutoff_ms: cutoff_ms(now_ms, timeout),
            })
            .await?;
        let granted = reply.into_text();
        debug!(granted = granted.is_some(), "semaphore acquisition");
        Ok(granted)
    }

    /// Poll [`Self::acquire`] until granted or `wait` elapses.
    pub async fn acquire_within(
        &self,
        semname: &str,
        limit: u64,
        timeout: Duration,
        wait: Duration,
    ) -> Result<Option<String>, CoordError> {
        check_limit(limit)?;
        retry_until(Instant::now() + wait, self.config.poll_interval(), || {
            self.acquire(semname, limit, timeout)
        })
        .await
    }

    /// Give the slot back. Returns `false` if the token was no longer held.
    pub async fn release(&self, semname: &str, token: &str) -> Result<bool, CoordError> {
        Ok(self.store.zrem(semname, &[token]).await? > 0)
    }

    /// Re-timestamp a held slot. Returns `false` if the slot was lost.
    pub async fn refresh(&self, semname: &str, token: &str) -> Result<bool, CoordError> {
        let reply = self
            .store
            .run_script(&AtomicOp::RefreshSemaphore {
                key: semname.to_owned(),
                token: token.to_owned(),
                now_ms: self.clock.now_ms(),
            })
            .await?;
        Ok(reply.is_truthy())
    }
}

/// FIFO counting semaphore.
///
/// Uses three keys: the timestamp set `semname`, the ticket set
/// `semname:owner` and the ticket counter `semname:counter`.
#[derive(Clone)]
pub struct FairSemaphore {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
    config: SemaphoreConfig,
}

impl FairSemaphore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), SemaphoreConfig::default())
    }

    pub fn with_clock(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: SemaphoreConfig) -> Self {
        let locks = LockManager::new(Arc::clone(&store));
        Self {
            store,
            clock,
            locks,
            config,
        }
    }

    /// Try once to take one of `limit` slots, ranked by ticket order.
    #[instrument(name = "fair_semaphore.acquire", skip(self), fields(semaphore = %semname))]
    pub async fn acquire(
        &self,
        semname: &str,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<String>, CoordError> {
        check_limit(limit)?;
        let now_ms = self.clock.now_ms();
        let reply = self
            .store
            .run_script(&AtomicOp::AcquireFairSemaphore {
                key: semname.to_owned(),
                owner_key: owner_key(semname),
                counter_key: counter_key(semname),
                token: Uuid::new_v4().to_string(),
                limit,
                now_ms,
                cutoff_ms: cutoff_ms(now_ms, timeout),
            })
            .await?;
        let granted = reply.into_text();
        debug!(granted = granted.is_some(), "fair semaphore acquisition");
        Ok(granted)
    }

    /// Poll [`Self::acquire`] until granted or `wait` elapses.
    pub async fn acquire_within(
        &self,
        semname: &str,
        limit: u64,
        timeout: Duration,
        wait: Duration,
    ) -> Result<Option<String>, CoordError> {
        check_limit(limit)?;
        retry_until(Instant::now() + wait, self.config.poll_interval(), || {
            self.acquire(semname, limit, timeout)
        })
        .await
    }

    /// Acquire while holding the lock named `semname`.
    ///
    /// Serialising acquisitions closes the window in which a client with a
    /// lagging clock could have its fresh entry purged by another client's
    /// cutoff. Returns `None` if the guard lock was busy.
    pub async fn acquire_with_lock(
        &self,
        semname: &str,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<String>, CoordError> {
        check_limit(limit)?;
        let granted = self
            .locks
            .with_lock(
                semname,
                self.config.lock_acquire_timeout(),
                self.config.lock_lease(),
                || self.acquire(semname, limit, timeout),
            )
            .await?;
        Ok(granted.flatten())
    }

    /// Remove `token` from both sets. Returns whether it was a live holder.
    pub async fn release(&self, semname: &str, token: &str) -> Result<bool, CoordError> {
        let reply = self
            .store
            .run_script(&AtomicOp::ReleaseFairSemaphore {
                key: semname.to_owned(),
                owner_key: owner_key(semname),
                token: token.to_owned(),
            })
            .await?;
        Ok(reply.is_truthy())
    }

    /// Re-timestamp a held slot. On `false` the slot is gone and any partial
    /// entry has been cleaned up.
    pub async fn refresh(&self, semname: &str, token: &str) -> Result<bool, CoordError> {
        let reply = self
            .store
            .run_script(&AtomicOp::RefreshFairSemaphore {
                key: semname.to_owned(),
                owner_key: owner_key(semname),
                token: token.to_owned(),
                now_ms: self.clock.now_ms(),
            })
            .await?;
        Ok(reply.is_truthy())
    }
}
