//! Redis backend for kvsync.
//!
//! This crate provides a Redis-backed implementation of the
//! [`KvStore`](kvsync_store::KvStore) trait from `kvsync-store`.
//!
//! # Features
//!
//! - **Store primitives**: strings, sorted sets, sets and lists map one to
//!   one onto Redis commands.
//! - **Transactions**: watch sessions use `WATCH`/`MULTI`/`EXEC` on a
//!   connection held for the life of the session.
//! - **Atomic operations**: every [`AtomicOp`](kvsync_store::AtomicOp) runs
//!   as a Lua script.
//! - **Connection pooling**: uses `deadpool-redis`.
//!
//! # Consistency
//!
//! Locks and semaphores built on this backend give mutual exclusion on a
//! single Redis instance. With Sentinel or Cluster failover, asynchronous
//! replication can lose a grant that was acknowledged just before the
//! failover. Sharded-queue scripts derive shard keys inside Lua and therefore
//! require every shard of a queue to live on one node.
//!
//! # Example
//!
//! ```ignore
//! use kvsync_store_redis::{RedisConfig, RedisStore};
//!
//! let store = RedisStore::new(&RedisConfig::new("redis://localhost:6379"))?;
//! ```

mod config;
mod key_render;
mod scripts;
mod store;
mod tx;

pub use config::RedisConfig;
pub use store::RedisStore;
