//! Capability interface for the shared key-value store used by kvsync.
//!
//! The coordination layer depends only on the [`KvStore`] trait defined here.
//! Backends (`kvsync-store-memory`, `kvsync-store-redis`) implement it and
//! prove conformance with the suites in [`testing`].

pub mod atomic;
pub mod error;
pub mod store;
pub mod testing;
pub mod tx;

pub use atomic::{AtomicOp, Reply};
pub use error::StoreError;
pub use store::{KeyTtl, KvStore, ListEnd, SetOp};
pub use tx::{Command, TxResult, WatchSession};
