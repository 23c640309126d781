//! Coordination primitives built on a shared [`KvStore`].
//!
//! Every process that points at the same store takes part in the same
//! protocol:
//!
//! - [`LockManager`]: expiring mutual-exclusion locks
//! - [`Semaphore`] and [`FairSemaphore`]: counting semaphores, the latter
//!   granting slots in arrival order
//! - [`ShardedQueue`]: lists spread over fixed-size shards, with blocking pops
//! - [`AutocompleteIndex`]: prefix lookups over member names
//! - [`DelayedQueue`] and [`Worker`]: scheduled tasks and their consumers
//!
//! Contention is reported as data rather than as an error: a lock or slot
//! that could not be obtained in time is `None`, and releasing something the
//! caller no longer holds returns `false`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kvsync_coord::LockManager;
//! use kvsync_store_memory::MemoryStore;
//!
//! let locks = LockManager::new(Arc::new(MemoryStore::new()));
//! if let Some(token) = locks
//!     .acquire("inventory", Duration::from_secs(1), Duration::from_secs(10))
//!     .await?
//! {
//!     // Critical section...
//!     locks.release("inventory", &token).await?;
//! }
//! ```
//!
//! [`KvStore`]: kvsync_store::KvStore

pub mod autocomplete;
pub mod cache;
pub mod clock;
pub mod config;
pub mod delayed;
pub mod error;
mod keys;
pub mod lock;
pub mod queue;
pub mod retry;
pub mod semaphore;
pub mod setops;
pub mod worker;

pub use autocomplete::{AutocompleteIndex, find_prefix_range};
pub use cache::{RemoteConfig, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordConfig;
pub use delayed::{DelayedPoller, DelayedQueue, DelayedTask};
pub use error::CoordError;
pub use lock::LockManager;
pub use queue::ShardedQueue;
pub use retry::retry_until;
pub use semaphore::{FairSemaphore, Semaphore};
pub use setops::combine;
pub use worker::{Dispatch, TaskHandler, Worker, WorkerBuilder};
