//! In-memory [`kvsync_store::KvStore`] backend.
//!
//! Intended for tests and single-process use. It implements every store
//! primitive, transaction and atomic operation with the same observable
//! semantics as the Redis backend.

mod keyspace;
mod script;
mod store;
mod tx;

pub use store::MemoryStore;
