use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoordError;

/// Top-level configuration for the coordination layer.
///
/// Every section and field is optional in TOML; missing values fall back to
/// the defaults documented on each field.
#[derive(Debug, Default, Deserialize)]
pub struct CoordConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub semaphore: SemaphoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub autocomplete: AutocompleteConfig,
    #[serde(default)]
    pub delayed: DelayedConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl CoordConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, CoordError> {
        toml::from_str(source).map_err(|e| CoordError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoordError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| CoordError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }
}

/// Lock manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Sleep between acquisition attempts in milliseconds (default: 1).
    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl LockConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

/// Semaphore settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SemaphoreConfig {
    /// How long `acquire_with_lock` waits for the guard lock (default: 10 ms).
    #[serde(default = "default_guard_lock_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,
    /// Lease of the guard lock in milliseconds (default: 10 s).
    #[serde(default = "default_guard_lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// Sleep between attempts in `acquire_within` (default: 10 ms).
    #[serde(default = "default_semaphore_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl SemaphoreConfig {
    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout_ms: default_guard_lock_timeout_ms(),
            lock_lease_ms: default_guard_lock_lease_ms(),
            poll_interval_ms: default_semaphore_poll_interval_ms(),
        }
    }
}

/// Sharded queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Shard capacity; each shard holds at most `chunk_size - 1` items
    /// (default: 512).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Items handed to one atomic push (default: 64).
    #[serde(default = "default_push_batch")]
    pub push_batch: usize,
    /// Longest single blocking wait on one shard in milliseconds
    /// (default: 1000).
    #[serde(default = "default_blocking_slice_ms")]
    pub blocking_slice_ms: u64,
}

impl QueueConfig {
    pub fn blocking_slice(&self) -> Duration {
        Duration::from_millis(self.blocking_slice_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            push_batch: default_push_batch(),
            blocking_slice_ms: default_blocking_slice_ms(),
        }
    }
}

/// Autocomplete index settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AutocompleteConfig {
    /// Maximum number of suggestions returned (default: 10).
    #[serde(default = "default_window")]
    pub window: u64,
    /// Attempts before a contended lookup gives up (default: 32).
    #[serde(default = "default_max_watch_retries")]
    pub max_watch_retries: u32,
}

impl Default for AutocompleteConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_watch_retries: default_max_watch_retries(),
        }
    }
}

/// Delayed task scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DelayedConfig {
    /// Idle sleep between polls in milliseconds (default: 10).
    #[serde(default = "default_delayed_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long to wait for a task's lock in milliseconds (default: 10).
    #[serde(default = "default_delayed_lock_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,
    /// Lease of a task's lock in milliseconds (default: 10 s).
    #[serde(default = "default_delayed_lock_lease_ms")]
    pub lock_lease_ms: u64,
}

impl DelayedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

impl Default for DelayedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_delayed_poll_interval_ms(),
            lock_acquire_timeout_ms: default_delayed_lock_timeout_ms(),
            lock_lease_ms: default_delayed_lock_lease_ms(),
        }
    }
}

/// Queue worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Blocking pop timeout per loop iteration in milliseconds
    /// (default: 1000).
    #[serde(default = "default_worker_pop_timeout_ms")]
    pub pop_timeout_ms: u64,
    /// Pause after a failed iteration in milliseconds (default: 100).
    #[serde(default = "default_worker_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl WorkerConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pop_timeout_ms: default_worker_pop_timeout_ms(),
            error_backoff_ms: default_worker_error_backoff_ms(),
        }
    }
}

fn default_lock_retry_interval_ms() -> u64 {
    1
}

fn default_guard_lock_timeout_ms() -> u64 {
    10
}

fn default_guard_lock_lease_ms() -> u64 {
    10_000
}

fn default_semaphore_poll_interval_ms() -> u64 {
    10
}

fn default_chunk_size() -> u64 {
    512
}

fn default_push_batch() -> usize {
    64
}

fn default_blocking_slice_ms() -> u64 {
    1_000
}

fn default_window() -> u64 {
    10
}

fn default_max_watch_retries() -> u32 {
    32
}

fn default_delayed_poll_interval_ms() -> u64 {
    10
}

fn default_delayed_lock_timeout_ms() -> u64 {
    10
}

fn default_delayed_lock_lease_ms() -> u64 {
    10_000
}

fn default_worker_pop_timeout_ms() -> u64 {
    1_000
}

fn default_worker_error_backoff_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CoordConfig::from_toml_str("").unwrap();
        assert_eq!(config.lock.retry_interval(), Duration::from_millis(1));
        assert_eq!(config.semaphore.lock_acquire_timeout(), Duration::from_millis(10));
        assert_eq!(config.semaphore.lock_lease(), Duration::from_secs(10));
        assert_eq!(config.queue.chunk_size, 512);
        assert_eq!(config.queue.push_batch, 64);
        assert_eq!(config.queue.blocking_slice(), Duration::from_secs(1));
        assert_eq!(config.autocomplete.window, 10);
        assert_eq!(config.worker.pop_timeout(), Duration::from_secs(1));
        assert_eq!(config.worker.error_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml = r"
            [queue]
            chunk_size = 4

            [autocomplete]
            max_watch_retries = 3
        ";
        let config = CoordConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.queue.chunk_size, 4);
        assert_eq!(config.queue.push_batch, 64);
        assert_eq!(config.autocomplete.max_watch_retries, 3);
        assert_eq!(config.autocomplete.window, 10);
        assert_eq!(config.delayed.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn malformed_document_is_a_config_error() {
        let err = CoordConfig::from_toml_str("[queue]\nchunk_size = \"big\"").unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = CoordConfig::from_file("/nonexistent/kvsync.toml").unwrap_err();
        assert!(matches!(err, CoordError::Config(msg) if msg.contains("kvsync.toml")));
    }
}
