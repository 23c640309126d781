//! Process-local caching of values read from the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use kvsync_store::KvStore;

use crate::error::CoordError;
use crate::keys::config_key;

struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

/// Values keyed by string, each remembered with the time it was fetched.
pub struct TtlCache<V> {
    entries: DashMap<String, Cached<V>>,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached value for `key` if it was fetched less than `max_age` ago,
    /// otherwise the result of `fetch`, which replaces the cached entry.
    ///
    /// Concurrent misses on the same key may each call `fetch`; the last one
    /// to finish wins. A failed fetch leaves the previous entry in place.
    pub async fn get_or_fetch<E, F, Fut>(&self, key: &str, max_age: Duration, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let fresh = self
            .entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < max_age)
            .map(|entry| entry.value.clone());
        if let Some(value) = fresh {
            return Ok(value);
        }

        let value = fetch().await?;
        self.entries.insert(
            key.to_owned(),
            Cached {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// JSON configuration documents shared through the store at
/// `config:{kind}:{component}`, cached locally for `max_age`.
pub struct RemoteConfig {
    store: Arc<dyn KvStore>,
    cache: TtlCache<serde_json::Value>,
    max_age: Duration,
}

impl RemoteConfig {
    pub fn new(store: Arc<dyn KvStore>, max_age: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(),
            max_age,
        }
    }

    /// The document for `component`, or an empty object if none was stored.
    pub async fn get(&self, kind: &str, component: &str) -> Result<serde_json::Value, CoordError> {
        let key = config_key(kind, component);
        self.cache
            .get_or_fetch(&key, self.max_age, || async {
                debug!(%key, "fetching remote config");
                match self.store.get(&key).await? {
                    Some(raw) => Ok(serde_json::from_str(&raw)?),
                    None => Ok(serde_json::Value::Object(serde_json::Map::new())),
                }
            })
            .await
    }

    /// [`Self::get`] decoded into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, kind: &str, component: &str) -> Result<T, CoordError> {
        Ok(serde_json::from_value(self.get(kind, component).await?)?)
    }

    /// Store a new document. Other processes see it once their cached copy
    /// ages out; this instance sees it immediately.
    pub async fn set<T: Serialize + ?Sized>(&self, kind: &str, component: &str, value: &T) -> Result<(), CoordError> {
        let key = config_key(kind, component);
        let raw = serde_json::to_string(value)?;
        self.store.set(&key, &raw, None).await?;
        self.cache.invalidate(&key);
        Ok(())
    }
}
