//! Expiring mutual-exclusion locks.
//!
//! A lock named `n` is the key `lock:n` holding the owner's random token, set
//! only if absent and with a store-managed expiry equal to the lease. The lease
//! is the only recovery path for a crashed holder: there is no heartbeat, so
//! callers must pick a lease longer than their critical section.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use kvsync_store::{AtomicOp, Command, KvStore, TxResult};

use crate::config::LockConfig;
use crate::error::CoordError;
use crate::keys::lock_key;
use crate::retry::retry_until;

/// Acquires and releases named locks on a shared store.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Try to take `name` until `acquire_timeout` elapses.
    ///
    /// Returns the owner token on success and `None` on timeout. A zero
    /// timeout makes exactly one attempt. A zero `lease` is rejected.
    #[instrument(name = "lock.acquire", skip(self), fields(lock = %name))]
    pub async fn acquire(
        &self,
        name: &str,
        acquire_timeout: Duration,
        lease: Duration,
    ) -> Result<Option<String>, CoordError> {
        if lease.is_zero() {
            return Err(CoordError::InvalidArgument("lock lease must be positive".into()));
        }
        let token = Uuid::new_v4().to_string();
        let op = AtomicOp::AcquireLock {
            key: lock_key(name),
            token: token.clone(),
            lease,
        };
        let deadline = Instant::now() + acquire_timeout;
        let (store, op) = (&self.store, &op);
        let acquired = retry_until(deadline, self.config.retry_interval(), move || async move {
            let reply = store.run_script(op).await?;
            Ok::<_, CoordError>(reply.is_truthy().then_some(()))
        })
        .await?;

        if acquired.is_some() {
            debug!("lock acquired");
            Ok(Some(token))
        } else {
            debug!("lock acquisition timed out");
            Ok(None)
        }
    }

    /// Single acquisition attempt.
    pub async fn try_acquire(&self, name: &str, lease: Duration) -> Result<Option<String>, CoordError> {
        self.acquire(name, Duration::ZERO, lease).await
    }

    /// Delete the lock if `token` still owns it.
    ///
    /// Returns `false` when the lock expired or belongs to someone else.
    #[instrument(name = "lock.release", skip(self, token), fields(lock = %name))]
    pub async fn release(&self, name: &str, token: &str) -> Result<bool, CoordError> {
        let reply = self
            .store
            .run_script(&AtomicOp::ReleaseLock {
                key: lock_key(name),
                token: token.to_owned(),
            })
            .await?;
        Ok(reply.is_truthy())
    }

    /// Release through an optimistic transaction instead of an atomic script.
    ///
    /// Watches the lock key, compares the stored token and deletes it in a
    /// transaction, starting over whenever the key changes underneath.
    #[instrument(name = "lock.release_with_watch", skip(self, token), fields(lock = %name))]
    pub async fn release_with_watch(&self, name: &str, token: &str) -> Result<bool, CoordError> {
        let key = lock_key(name);
        loop {
            let mut session = self.store.watch(&[key.as_str()]).await?;
            if session.get(&key).await?.as_deref() != Some(token) {
                session.unwatch().await?;
                return Ok(false);
            }
            let outcome = session
                .exec(vec![Command::Delete {
                    keys: vec![key.clone()],
                }])
                .await?;
            match outcome {
                TxResult::Committed(_) => return Ok(true),
                TxResult::Conflict => debug!("lock changed during release, retrying"),
            }
        }
    }

    /// Run `f` while holding `name`.
    ///
    /// Returns `None` without running `f` if the lock could not be taken in
    /// time. The lock is released whether or not `f` fails; an error from `f`
    /// takes precedence over a release error.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        name: &str,
        acquire_timeout: Duration,
        lease: Duration,
        f: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordError>,
    {
        let Some(token) = self.acquire(name, acquire_timeout, lease).await? else {
            return Ok(None);
        };
        let result = f().await;
        let released = self.release(name, &token).await;
        let value = result?;
        if !released? {
            debug!(lock = %name, "lock expired before release");
        }
        Ok(Some(value))
    }
}
