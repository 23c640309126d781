use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kvsync_store::atomic::Reply;
use kvsync_store::error::StoreError;
use kvsync_store::tx::{Command, TxResult, WatchSession};

use crate::script;
use crate::store::Shared;

/// Optimistic transaction over a [`crate::MemoryStore`].
///
/// Remembers the version of every watched key when opened; `exec` commits
/// only if none of those versions moved.
pub(crate) struct MemoryWatchSession {
    shared: Arc<Shared>,
    watched: Vec<(String, u64)>,
}

impl MemoryWatchSession {
    pub(crate) fn new(shared: Arc<Shared>, keys: &[&str]) -> Self {
        let watched = {
            let ks = shared.keyspace.lock();
            keys.iter()
                .map(|key| ((*key).to_owned(), ks.version(key)))
                .collect()
        };
        Self { shared, watched }
    }
}

#[async_trait]
impl WatchSession for MemoryWatchSession {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.shared.keyspace.lock().get(key)
    }

    async fn zrank(&mut self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        self.shared.keyspace.lock().zrank(key, member)
    }

    async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.shared.keyspace.lock().zscore(key, member)
    }

    async fn exec(self: Box<Self>, commands: Vec<Command>) -> Result<TxResult, StoreError> {
        commands.iter().try_for_each(Command::validate)?;
        let replies = {
            let mut ks = self.shared.keyspace.lock();
            // Reads may lazily evict, which bumps versions just like Redis
            // treats an expiry as a modification of a watched key.
            let changed = self
                .watched
                .iter()
                .find(|(key, version)| ks.version(key) != *version);
            if let Some((key, _)) = changed {
                debug!(key = %key, "watched key changed, aborting transaction");
                return Ok(TxResult::Conflict);
            }
            commands
                .iter()
                .map(|command| script::apply(&mut ks, command))
                .collect::<Result<Vec<Reply>, _>>()?
        };
        self.shared.wake_poppers();
        Ok(TxResult::Committed(replies))
    }

    async fn unwatch(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
