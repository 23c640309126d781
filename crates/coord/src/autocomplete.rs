//! Prefix lookup over an ordered set of names.
//!
//! All members of `members:{guild}` share score 0, so the set is ordered by
//! name. A lookup inserts two sentinel members that sort immediately before
//! and after every name with the requested prefix, reads the members between
//! them and removes the sentinels again in one transaction.
//!
//! Names are expected to use lowercase ASCII letters; `{` is reserved for
//! sentinels.

use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use kvsync_store::{Command, KvStore, Reply, TxResult};

use crate::config::AutocompleteConfig;
use crate::error::CoordError;
use crate::keys::members_key;

/// Characters a name may end in, in sort order. The backtick sorts just
/// before `a` and `{` just after `z`.
const ALPHABET: &str = "`abcdefghijklmnopqrstuvwxyz{";

const SENTINEL_MARK: char = '{';

/// Range bounds `(start, end)` enclosing every name that starts with `prefix`.
///
/// The start bound replaces the last character with its predecessor in
/// [`ALPHABET`]; the end bound is the prefix itself. Both end in `{`, which
/// sorts after every valid name character.
pub fn find_prefix_range(prefix: &str) -> (String, String) {
    let (head, position) = match prefix.chars().last() {
        Some(last) => (
            &prefix[..prefix.len() - last.len_utf8()],
            ALPHABET.chars().filter(|c| *c < last).count(),
        ),
        None => ("", 0),
    };
    let suffix = ALPHABET
        .chars()
        .nth(position.saturating_sub(1))
        .unwrap_or('`');
    (format!("{head}{suffix}{{"), format!("{prefix}{{"))
}

#[derive(Clone)]
pub struct AutocompleteIndex {
    store: Arc<dyn KvStore>,
    config: AutocompleteConfig,
}

impl AutocompleteIndex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, AutocompleteConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, config: AutocompleteConfig) -> Self {
        Self { store, config }
    }

    /// Add `member` to the guild's index.
    pub async fn join(&self, guild: &str, member: &str) -> Result<(), CoordError> {
        if member.contains(SENTINEL_MARK) {
            return Err(CoordError::InvalidArgument(format!(
                "member name {member:?} contains the reserved character {SENTINEL_MARK:?}"
            )));
        }
        self.store.zadd(&members_key(guild), member, 0.0).await?;
        Ok(())
    }

    /// Remove `member` from the guild's index.
    pub async fn leave(&self, guild: &str, member: &str) -> Result<(), CoordError> {
        self.store.zrem(&members_key(guild), &[member]).await?;
        Ok(())
    }

    /// Up to `window` members of `guild` starting with `prefix`, in order.
    ///
    /// Gives up with an empty result after `max_watch_retries` conflicting
    /// attempts.
    #[instrument(name = "autocomplete.lookup", skip(self), fields(%guild))]
    pub async fn autocomplete(&self, guild: &str, prefix: &str) -> Result<Vec<String>, CoordError> {
        let key = members_key(guild);
        let (start, end) = find_prefix_range(prefix);
        let id = Uuid::new_v4();
        let start = format!("{start}{id}");
        let end = format!("{end}{id}");

        for attempt in 1..=self.config.max_watch_retries {
            self.store.zadd(&key, &start, 0.0).await?;
            self.store.zadd(&key, &end, 0.0).await?;

            let mut session = self.store.watch(&[key.as_str()]).await?;
            let (Some(first), Some(last)) = (
                session.zrank(&key, &start).await?,
                session.zrank(&key, &end).await?,
            ) else {
                session.unwatch().await?;
                debug!(attempt, "sentinel disappeared, retrying");
                continue;
            };

            let first = i64::try_from(first).unwrap_or(i64::MAX);
            let last = i64::try_from(last).unwrap_or(i64::MAX);
            let window = i64::try_from(self.config.window).unwrap_or(i64::MAX);
            // Ranks shift down by one once the start sentinel is gone.
            let stop = first.saturating_add(window - 1).min(last - 2);

            let mut commands = vec![Command::ZRem {
                key: key.clone(),
                members: vec![start.clone(), end.clone()],
            }];
            let ranged = window > 0 && stop >= first;
            if ranged {
                commands.push(Command::ZRange {
                    key: key.clone(),
                    start: first,
                    stop,
                });
            }

            match session.exec(commands).await? {
                TxResult::Committed(replies) => {
                    let items = if ranged {
                        replies.into_iter().last().map(Reply::into_list).unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    return Ok(items
                        .into_iter()
                        .filter(|item| !item.contains(SENTINEL_MARK))
                        .collect());
                }
                TxResult::Conflict => debug!(attempt, "member index changed, retrying"),
            }
        }

        self.store.zrem(&key, &[start.as_str(), end.as_str()]).await?;
        warn!(
            retries = self.config.max_watch_retries,
            "autocomplete gave up under contention"
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use kvsync_store_memory::MemoryStore;

    use super::*;

    #[test]
    fn prefix_ranges() {
        assert_eq!(find_prefix_range("abc"), ("abb{".to_owned(), "abc{".to_owned()));
        assert_eq!(find_prefix_range("a"), ("`{".to_owned(), "a{".to_owned()));
        assert_eq!(find_prefix_range("ba"), ("b`{".to_owned(), "ba{".to_owned()));
        assert_eq!(find_prefix_range("z"), ("y{".to_owned(), "z{".to_owned()));
        assert_eq!(find_prefix_range(""), ("`{".to_owned(), "{".to_owned()));
    }

    async fn index_with(members: &[&str]) -> (MemoryStore, AutocompleteIndex) {
        let store = MemoryStore::new();
        let index = AutocompleteIndex::new(Arc::new(store.clone()));
        for member in members {
            index.join("guild", member).await.unwrap();
        }
        (store, index)
    }

    #[tokio::test]
    async fn finds_members_with_prefix() {
        let (store, index) =
            index_with(&["jack", "jean", "jenny", "jeremy", "john", "bob", "jeb"]).await;
        assert_eq!(
            index.autocomplete("guild", "je").await.unwrap(),
            ["jean", "jeb", "jenny", "jeremy"]
        );
        assert_eq!(
            index.autocomplete("guild", "j").await.unwrap(),
            ["jack", "jean", "jeb", "jenny", "jeremy", "john"]
        );
        assert!(index.autocomplete("guild", "x").await.unwrap().is_empty());
        // No sentinel is left behind.
        assert_eq!(store.zcard("members:guild").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn exact_name_is_its_own_match() {
        let (_, index) = index_with(&["ann", "anna", "annie"]).await;
        assert_eq!(
            index.autocomplete("guild", "ann").await.unwrap(),
            ["ann", "anna", "annie"]
        );
    }

    #[tokio::test]
    async fn window_caps_results() {
        let store = MemoryStore::new();
        let index = AutocompleteIndex::with_config(
            Arc::new(store),
            AutocompleteConfig {
                window: 2,
                max_watch_retries: 4,
            },
        );
        for member in ["aa", "ab", "ac", "ad"] {
            index.join("g", member).await.unwrap();
        }
        assert_eq!(index.autocomplete("g", "a").await.unwrap(), ["aa", "ab"]);
    }

    #[tokio::test]
    async fn leave_removes_member() {
        let (_, index) = index_with(&["max", "mia"]).await;
        index.leave("guild", "max").await.unwrap();
        assert_eq!(index.autocomplete("guild", "m").await.unwrap(), ["mia"]);
    }

    #[tokio::test]
    async fn reserved_character_is_rejected() {
        let (_, index) = index_with(&[]).await;
        let err = index.join("guild", "bad{name").await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn empty_guild_has_no_suggestions() {
        let (store, index) = index_with(&[]).await;
        assert!(index.autocomplete("guild", "a").await.unwrap().is_empty());
        assert_eq!(store.zcard("members:guild").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_lookups_do_not_leak_sentinels() {
        let (store, index) = index_with(&["sam", "sara", "seth", "sue"]).await;
        let lookups: Vec<_> = ["s", "sa", "se", "su"]
            .into_iter()
            .map(|prefix| {
                let index = index.clone();
                tokio::spawn(async move { index.autocomplete("guild", prefix).await })
            })
            .collect();
        let mut results = Vec::new();
        for lookup in lookups {
            results.push(lookup.await.unwrap().unwrap());
        }
        assert_eq!(results[0], ["sam", "sara", "seth", "sue"]);
        assert_eq!(results[1], ["sam", "sara"]);
        assert_eq!(results[2], ["seth"]);
        assert_eq!(results[3], ["sue"]);
        assert_eq!(store.zcard("members:guild").await.unwrap(), 4);
    }
}
