//! Temporary set combinations over `idx:` keyed sets.

use std::time::Duration;

use tracing::instrument;
use uuid::Uuid;

use kvsync_store::{Command, KvStore, SetOp};

use crate::error::CoordError;
use crate::keys::index_key;

/// Store the `op` combination of the sets `idx:{name}` for each of `names`
/// into a fresh `idx:{id}` that expires after `ttl`, and return `id`.
///
/// The combination and the expiry are applied as one transaction, so the
/// result set never exists without a TTL.
#[instrument(name = "setops.combine", skip(store, names), fields(%op, inputs = names.len()))]
pub async fn combine(
    store: &dyn KvStore,
    op: SetOp,
    names: &[&str],
    ttl: Duration,
) -> Result<String, CoordError> {
    if names.is_empty() {
        return Err(CoordError::InvalidArgument(format!(
            "{op} needs at least one input set"
        )));
    }
    let id = Uuid::new_v4().to_string();
    let dest = index_key(&id);
    store
        .multi_exec(vec![
            Command::SetStore {
                op,
                dest: dest.clone(),
                keys: names.iter().map(|name| index_key(name)).collect(),
            },
            Command::Expire { key: dest, ttl },
        ])
        .await?;
    Ok(id)
}

pub async fn intersect(store: &dyn KvStore, names: &[&str], ttl: Duration) -> Result<String, CoordError> {
    combine(store, SetOp::Intersect, names, ttl).await
}

pub async fn union(store: &dyn KvStore, names: &[&str], ttl: Duration) -> Result<String, CoordError> {
    combine(store, SetOp::Union, names, ttl).await
}

pub async fn difference(store: &dyn KvStore, names: &[&str], ttl: Duration) -> Result<String, CoordError> {
    combine(store, SetOp::Difference, names, ttl).await
}

/// Members of a combination result (or any `idx:` set), sorted.
pub async fn members(store: &dyn KvStore, id: &str) -> Result<Vec<String>, CoordError> {
    Ok(store.smembers(&index_key(id)).await?)
}

#[cfg(test)]
mod tests {
    use kvsync_store::KeyTtl;
    use kvsync_store_memory::MemoryStore;

    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.sadd("idx:rust", &["doc1", "doc2", "doc3"]).await.unwrap();
        store.sadd("idx:async", &["doc2", "doc3", "doc4"]).await.unwrap();
        store.sadd("idx:redis", &["doc3", "doc5"]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn combinations() {
        let store = seeded().await;

        let id = intersect(&store, &["rust", "async"], TTL).await.unwrap();
        assert_eq!(members(&store, &id).await.unwrap(), ["doc2", "doc3"]);

        let id = union(&store, &["rust", "redis"], TTL).await.unwrap();
        assert_eq!(
            members(&store, &id).await.unwrap(),
            ["doc1", "doc2", "doc3", "doc5"]
        );

        let id = difference(&store, &["rust", "async"], TTL).await.unwrap();
        assert_eq!(members(&store, &id).await.unwrap(), ["doc1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn result_expires() {
        let store = seeded().await;
        let id = union(&store, &["rust"], TTL).await.unwrap();
        assert!(matches!(
            store.ttl(&format!("idx:{id}")).await.unwrap(),
            KeyTtl::Expires(_)
        ));
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(members(&store, &id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_inputs_is_rejected() {
        let store = MemoryStore::new();
        let err = intersect(&store, &[], TTL).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidArgument(_)));
    }
}
