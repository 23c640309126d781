use thiserror::Error;

/// Hard failures from a key-value store backend.
///
/// Contention (a lock not obtained, a watched key that changed) is never
/// reported through this type; it surfaces as `None`, `false` or
/// [`TxResult::Conflict`](crate::tx::TxResult::Conflict).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Shorthand for a [`StoreError::WrongType`] on `key`.
    pub fn wrong_type(key: &str, expected: &'static str) -> Self {
        Self::WrongType {
            key: key.to_owned(),
            expected,
        }
    }
}
