use std::time::Duration;

/// Configuration for the Redis store backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,

    /// Key prefix applied to every Redis key to avoid collisions. Empty
    /// means keys are used verbatim.
    pub prefix: String,

    /// Number of connections in the `deadpool-redis` pool. Each open watch
    /// session and each in-flight blocking pop holds one connection.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl RedisConfig {
    /// Default configuration pointing at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            prefix: String::from("kvsync"),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
        }
    }
}
