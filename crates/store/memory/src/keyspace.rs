use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use kvsync_store::error::StoreError;
use kvsync_store::store::{KeyTtl, ListEnd, SetOp};

/// Sorted-set score with a total order, so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Ordered set: members ranked by score, then member bytes.
#[derive(Debug, Clone, Default)]
pub(crate) struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    /// Insert or re-score. Returns `true` if the member is new.
    pub(crate) fn insert(&mut self, member: &str, score: f64) -> bool {
        let previous = self.scores.insert(member.to_owned(), score);
        if let Some(old) = previous {
            self.order.remove(&(Score(old), member.to_owned()));
        }
        self.order.insert((Score(score), member.to_owned()));
        previous.is_none()
    }

    pub(crate) fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(Score(score), member.to_owned()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub(crate) fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    pub(crate) fn rank(&self, member: &str) -> Option<u64> {
        let score = self.score(member)?;
        let rank = self.order.range(..(Score(score), member.to_owned())).count();
        u64::try_from(rank).ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.scores.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub(crate) fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(String, f64)> {
        let Some((start, stop)) = normalize_range(start, stop, self.len()) else {
            return Vec::new();
        };
        self.order
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    pub(crate) fn range_by_score(&self, min: f64, max: f64) -> Vec<(String, f64)> {
        self.order
            .iter()
            .filter(|(score, _)| score.0 >= min && score.0 <= max)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    /// Remove every member matching `pred`. Returns how many were removed.
    pub(crate) fn remove_where(&mut self, mut pred: impl FnMut(&str, f64) -> bool) -> u64 {
        let doomed: Vec<String> = self
            .order
            .iter()
            .filter(|(score, member)| pred(member, score.0))
            .map(|(_, member)| member.clone())
            .collect();
        for member in &doomed {
            self.remove(member);
        }
        doomed.len() as u64
    }

    pub(crate) fn members(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|(_, member)| member.as_str())
    }
}

/// Resolve Redis-style inclusive `start..=stop` indexes (negative counts from
/// the end) against a collection of `len` elements.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = (if start < 0 { start + len } else { start }).max(0);
    let stop = (if stop < 0 { stop + len } else { stop }).min(len - 1);
    if start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(SortedSet),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty_collection(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::ZSet(z) => z.is_empty(),
            Self::Set(s) => s.is_empty(),
            Self::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Shortest expiry a key can be given. Redis has millisecond resolution and
/// treats a zero `PX` as an error, so shorter TTLs are rounded up.
const MIN_TTL: Duration = Duration::from_millis(1);

type SetHandler = fn(&[BTreeSet<String>]) -> BTreeSet<String>;

/// Handler table resolving each [`SetOp`] to its combinator.
const SET_OP_HANDLERS: [(SetOp, SetHandler); 3] = [
    (SetOp::Intersect, intersect_all),
    (SetOp::Union, union_all),
    (SetOp::Difference, difference_all),
];

fn intersect_all(sets: &[BTreeSet<String>]) -> BTreeSet<String> {
    let Some((first, rest)) = sets.split_first() else {
        return BTreeSet::new();
    };
    first
        .iter()
        .filter(|m| rest.iter().all(|s| s.contains(*m)))
        .cloned()
        .collect()
}

fn union_all(sets: &[BTreeSet<String>]) -> BTreeSet<String> {
    sets.iter().flatten().cloned().collect()
}

fn difference_all(sets: &[BTreeSet<String>]) -> BTreeSet<String> {
    let Some((first, rest)) = sets.split_first() else {
        return BTreeSet::new();
    };
    first
        .iter()
        .filter(|m| !rest.iter().any(|s| s.contains(*m)))
        .cloned()
        .collect()
}

fn set_handler(op: SetOp) -> Result<SetHandler, StoreError> {
    SET_OP_HANDLERS
        .iter()
        .find(|(candidate, _)| *candidate == op)
        .map(|(_, handler)| *handler)
        .ok_or_else(|| StoreError::Backend(format!("no handler for set operation {op}")))
}

/// The whole in-memory dataset.
///
/// Every method runs under the caller's lock, so a sequence of calls made
/// while holding that lock is atomic. Expired keys are evicted lazily on
/// access. Each write stamps the key with a fresh version, which is what
/// watched transactions compare.
#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    clock: u64,
}

impl Keyspace {
    pub(crate) fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_owned(), self.clock);
    }

    fn evict(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_expired) {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    /// Drop a collection that became empty, mirroring Redis.
    fn prune(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_collection())
        {
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&Entry> {
        self.evict(key);
        self.entries.get(key)
    }

    fn entry_or_insert(&mut self, key: &str, init: fn() -> Value) -> &mut Entry {
        self.evict(key);
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(init()))
    }

    // -- strings ---------------------------------------------------------

    pub(crate) fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::wrong_type(key, "string")),
        }
    }

    pub(crate) fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut entry = Entry::new(Value::Str(value.to_owned()));
        entry.expires_at = ttl.map(|d| Instant::now() + d.max(MIN_TTL));
        self.entries.insert(key.to_owned(), entry);
        self.touch(key);
    }

    pub(crate) fn set_if_absent(&mut self, key: &str, value: &str) -> bool {
        if self.entry(key).is_some() {
            return false;
        }
        self.set(key, value, None);
        true
    }

    pub(crate) fn delete(&mut self, keys: &[&str]) -> u64 {
        let mut removed = 0;
        for key in keys {
            if self.entry(key).is_some() {
                self.entries.remove(*key);
                self.touch(key);
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        self.evict(key);
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.expires_at = Some(Instant::now() + ttl.max(MIN_TTL));
        self.touch(key);
        true
    }

    pub(crate) fn ttl(&mut self, key: &str) -> KeyTtl {
        match self.entry(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => KeyTtl::Expires(deadline.saturating_duration_since(Instant::now())),
        }
    }

    pub(crate) fn increment(&mut self, key: &str, by: i64) -> Result<i64, StoreError> {
        let entry = self.entry_or_insert(key, || Value::Str("0".to_owned()));
        let Value::Str(raw) = &mut entry.value else {
            return Err(StoreError::wrong_type(key, "string"));
        };
        let current: i64 = raw.parse().map_err(|e: std::num::ParseIntError| {
            StoreError::Serialization(format!("value at {key} is not an integer: {e}"))
        })?;
        let next = current
            .checked_add(by)
            .ok_or_else(|| StoreError::InvalidArgument(format!("increment overflows {key}")))?;
        *raw = next.to_string();
        self.touch(key);
        Ok(next)
    }

    // -- sorted sets -----------------------------------------------------

    fn zset(&mut self, key: &str) -> Result<Option<&SortedSet>, StoreError> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(StoreError::wrong_type(key, "zset")),
        }
    }

    /// Mutate a sorted set (created if missing), then stamp and prune it.
    fn with_zset<T>(
        &mut self,
        key: &str,
        f: impl FnOnce(&mut SortedSet) -> T,
    ) -> Result<T, StoreError> {
        let entry = self.entry_or_insert(key, || Value::ZSet(SortedSet::default()));
        let Value::ZSet(z) = &mut entry.value else {
            return Err(StoreError::wrong_type(key, "zset"));
        };
        let out = f(z);
        self.touch(key);
        self.prune(key);
        Ok(out)
    }

    pub(crate) fn zadd(&mut self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        self.with_zset(key, |z| z.insert(member, score))
    }

    pub(crate) fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self.zset(key)?.and_then(|z| z.score(member)))
    }

    pub(crate) fn zrank(&mut self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.zset(key)?.and_then(|z| z.rank(member)))
    }

    pub(crate) fn zrem(&mut self, key: &str, members: &[&str]) -> Result<u64, StoreError> {
        if self.zset(key)?.is_none() {
            return Ok(0);
        }
        self.with_zset(key, |z| {
            members.iter().filter(|m| z.remove(m)).count() as u64
        })
    }

    pub(crate) fn zrange_by_rank(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        Ok(self
            .zset(key)?
            .map(|z| z.range_by_rank(start, stop))
            .unwrap_or_default())
    }

    pub(crate) fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        Ok(self
            .zset(key)?
            .map(|z| z.range_by_score(min, max))
            .unwrap_or_default())
    }

    pub(crate) fn zrem_where(
        &mut self,
        key: &str,
        pred: impl FnMut(&str, f64) -> bool,
    ) -> Result<u64, StoreError> {
        if self.zset(key)?.is_none() {
            return Ok(0);
        }
        self.with_zset(key, |z| z.remove_where(pred))
    }

    pub(crate) fn zrem_range_by_rank(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<u64, StoreError> {
        let doomed: Vec<String> = self
            .zrange_by_rank(key, start, stop)?
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        let refs: Vec<&str> = doomed.iter().map(String::as_str).collect();
        self.zrem(key, &refs)
    }

    pub(crate) fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        Ok(self.zset(key)?.map_or(0, |z| z.len() as u64))
    }

    /// Keep only the members of `key` that are also members of `other`,
    /// preserving their scores in `key`.
    pub(crate) fn zintersect_keep(&mut self, key: &str, other: &str) -> Result<(), StoreError> {
        let keep: BTreeSet<String> = self
            .zset(other)?
            .map(|z| z.members().map(str::to_owned).collect())
            .unwrap_or_default();
        self.zrem_where(key, |member, _| !keep.contains(member))?;
        Ok(())
    }

    pub(crate) fn zcontains(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.zset(key)?.is_some_and(|z| z.contains(member)))
    }

    // -- sets ------------------------------------------------------------

    fn set_members(&mut self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        match self.entry(key) {
            None => Ok(BTreeSet::new()),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.clone()),
            Some(_) => Err(StoreError::wrong_type(key, "set")),
        }
    }

    pub(crate) fn sadd(&mut self, key: &str, members: &[&str]) -> Result<u64, StoreError> {
        let entry = self.entry_or_insert(key, || Value::Set(BTreeSet::new()));
        let Value::Set(set) = &mut entry.value else {
            return Err(StoreError::wrong_type(key, "set"));
        };
        let added = members
            .iter()
            .filter(|m| set.insert((**m).to_owned()))
            .count() as u64;
        self.touch(key);
        self.prune(key);
        Ok(added)
    }

    pub(crate) fn smembers(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.set_members(key)?.into_iter().collect())
    }

    pub(crate) fn set_op_store(
        &mut self,
        op: SetOp,
        dest: &str,
        keys: &[&str],
    ) -> Result<u64, StoreError> {
        let handler = set_handler(op)?;
        let sets = keys
            .iter()
            .map(|k| self.set_members(k))
            .collect::<Result<Vec<_>, _>>()?;
        let result = handler(&sets);
        let count = result.len() as u64;
        if result.is_empty() {
            self.entries.remove(dest);
        } else {
            self.entries
                .insert(dest.to_owned(), Entry::new(Value::Set(result)));
        }
        self.touch(dest);
        Ok(count)
    }

    // -- lists -----------------------------------------------------------

    pub(crate) fn push(
        &mut self,
        key: &str,
        end: ListEnd,
        items: &[&str],
    ) -> Result<u64, StoreError> {
        let entry = self.entry_or_insert(key, || Value::List(VecDeque::new()));
        let Value::List(list) = &mut entry.value else {
            return Err(StoreError::wrong_type(key, "list"));
        };
        for item in items {
            match end {
                ListEnd::Head => list.push_front((*item).to_owned()),
                ListEnd::Tail => list.push_back((*item).to_owned()),
            }
        }
        let len = list.len() as u64;
        self.touch(key);
        self.prune(key);
        Ok(len)
    }

    pub(crate) fn pop(&mut self, key: &str, end: ListEnd) -> Result<Option<String>, StoreError> {
        self.evict(key);
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        let Value::List(list) = &mut entry.value else {
            return Err(StoreError::wrong_type(key, "list"));
        };
        let item = match end {
            ListEnd::Head => list.pop_front(),
            ListEnd::Tail => list.pop_back(),
        };
        if item.is_some() {
            self.touch(key);
            self.prune(key);
        }
        Ok(item)
    }

    pub(crate) fn llen(&mut self, key: &str) -> Result<u64, StoreError> {
        match self.entry(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.len() as u64),
            Some(_) => Err(StoreError::wrong_type(key, "list")),
        }
    }
}
