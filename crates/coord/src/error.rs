use kvsync_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the coordination primitives.
///
/// Contention is not an error: a lock or semaphore that could not be
/// obtained in time is `None`, a release by a non-holder is `false`.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task handler {name} failed: {reason}")]
    Handler { name: String, reason: String },
}

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
