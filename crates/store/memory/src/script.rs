//! In-process execution of [`AtomicOp`] contracts and transaction commands.
//!
//! Callers hold the keyspace lock for the whole call, which is what makes
//! each operation atomic.

use kvsync_store::atomic::{AtomicOp, Reply, shard_key, shard_pointer_key};
use kvsync_store::error::StoreError;
use kvsync_store::store::ListEnd;
use kvsync_store::tx::Command;

use crate::keyspace::Keyspace;

#[allow(clippy::cast_precision_loss)]
fn score_ms(ms: i64) -> f64 {
    ms as f64
}

fn bool_reply(flag: bool) -> Reply {
    Reply::Int(i64::from(flag))
}

fn count_reply(n: u64) -> Reply {
    Reply::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Current shard index for `end`, defaulting to 0.
fn shard_pointer(ks: &mut Keyspace, queue: &str, end: ListEnd) -> Result<i64, StoreError> {
    let key = shard_pointer_key(queue, end);
    match ks.get(&key)? {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| {
            StoreError::Serialization(format!("shard pointer {key} is not an integer: {e}"))
        }),
    }
}

pub(crate) fn run(ks: &mut Keyspace, op: &AtomicOp) -> Result<Reply, StoreError> {
    match op {
        AtomicOp::AcquireLock { key, token, lease } => {
            if ks.get(key)?.is_some() {
                return Ok(Reply::Int(0));
            }
            ks.set(key, token, Some(*lease));
            Ok(Reply::Int(1))
        }

        AtomicOp::ReleaseLock { key, token } => {
            if ks.get(key)?.as_deref() == Some(token.as_str()) {
                ks.delete(&[key.as_str()]);
                return Ok(Reply::Int(1));
            }
            Ok(Reply::Int(0))
        }

        AtomicOp::AcquireSemaphore {
            key,
            token,
            limit,
            now_ms,
            cutoff_ms,
        } => {
            let cutoff = score_ms(*cutoff_ms);
            ks.zrem_where(key, |_, score| score < cutoff)?;
            ks.zadd(key, token, score_ms(*now_ms))?;
            match ks.zrank(key, token)? {
                Some(rank) if rank < *limit => Ok(Reply::Text(token.clone())),
                _ => {
                    ks.zrem(key, &[token.as_str()])?;
                    Ok(Reply::Nil)
                }
            }
        }

        AtomicOp::RefreshSemaphore { key, token, now_ms } => {
            if ks.zscore(key, token)?.is_none() {
                return Ok(Reply::Int(0));
            }
            ks.zadd(key, token, score_ms(*now_ms))?;
            Ok(Reply::Int(1))
        }

        AtomicOp::AcquireFairSemaphore {
            key,
            owner_key,
            counter_key,
            token,
            limit,
            now_ms,
            cutoff_ms,
        } => {
            let cutoff = score_ms(*cutoff_ms);
            ks.zrem_where(key, |_, score| score < cutoff)?;
            ks.zintersect_keep(owner_key, key)?;

            let ticket = ks.increment(counter_key, 1)?;
            ks.zadd(key, token, score_ms(*now_ms))?;
            ks.zadd(owner_key, token, score_ms(ticket))?;

            match ks.zrank(owner_key, token)? {
                Some(rank) if rank < *limit => Ok(Reply::Text(token.clone())),
                _ => {
                    ks.zrem(key, &[token.as_str()])?;
                    ks.zrem(owner_key, &[token.as_str()])?;
                    Ok(Reply::Nil)
                }
            }
        }

        AtomicOp::ReleaseFairSemaphore {
            key,
            owner_key,
            token,
        } => {
            let removed = ks.zrem(key, &[token.as_str()])?;
            ks.zrem(owner_key, &[token.as_str()])?;
            Ok(count_reply(removed))
        }

        AtomicOp::RefreshFairSemaphore {
            key,
            owner_key,
            token,
            now_ms,
        } => {
            if ks.zcontains(key, token)? && ks.zcontains(owner_key, token)? {
                ks.zadd(key, token, score_ms(*now_ms))?;
                return Ok(Reply::Int(1));
            }
            ks.zrem(key, &[token.as_str()])?;
            ks.zrem(owner_key, &[token.as_str()])?;
            Ok(Reply::Int(0))
        }

        AtomicOp::ShardedPush {
            queue,
            end,
            chunk_size,
            items,
        } => sharded_push(ks, queue, *end, *chunk_size, items),

        AtomicOp::ShardedPop { queue, end } => sharded_pop(ks, queue, *end),

        AtomicOp::ShardedPopNudge {
            queue,
            end,
            observed,
            marker,
        } => {
            if shard_pointer(ks, queue, *end)? == *observed {
                return Ok(Reply::Int(0));
            }
            ks.push(&shard_key(queue, *observed), *end, &[marker.as_str()])?;
            Ok(Reply::Int(1))
        }
    }
}

fn sharded_push(
    ks: &mut Keyspace,
    queue: &str,
    end: ListEnd,
    chunk_size: u64,
    items: &[String],
) -> Result<Reply, StoreError> {
    if items.is_empty() || chunk_size < 2 {
        return Ok(Reply::Int(0));
    }
    let pointer_key = shard_pointer_key(queue, end);
    let step = match end {
        ListEnd::Head => -1,
        ListEnd::Tail => 1,
    };
    let mut shard = shard_pointer(ks, queue, end)?;
    loop {
        let shard_list = shard_key(queue, shard);
        let current = ks.llen(&shard_list)?;
        let room = chunk_size.saturating_sub(current).saturating_sub(1);
        let count = usize::try_from(room).map_or(items.len(), |room| room.min(items.len()));
        if count > 0 {
            let batch: Vec<&str> = items[..count].iter().map(String::as_str).collect();
            ks.push(&shard_list, end, &batch)?;
            return Ok(count_reply(count as u64));
        }
        shard = ks.increment(&pointer_key, step)?;
    }
}

fn sharded_pop(ks: &mut Keyspace, queue: &str, end: ListEnd) -> Result<Reply, StoreError> {
    let mut shard = shard_pointer(ks, queue, end)?;
    let mut item = ks.pop(&shard_key(queue, shard), end)?;

    if item.is_none() || ks.llen(&shard_key(queue, shard))? == 0 {
        let other = shard_pointer(ks, queue, end.opposite())?;
        if shard == other {
            return Ok(item.map_or(Reply::Nil, Reply::Text));
        }
        let step = match end {
            ListEnd::Head => 1,
            ListEnd::Tail => -1,
        };
        shard = ks.increment(&shard_pointer_key(queue, end), step)?;
        if item.is_none() {
            item = ks.pop(&shard_key(queue, shard), end)?;
        }
    }
    Ok(item.map_or(Reply::Nil, Reply::Text))
}

/// Apply one queued transaction command.
pub(crate) fn apply(ks: &mut Keyspace, command: &Command) -> Result<Reply, StoreError> {
    command.validate()?;
    match command {
        Command::Set { key, value, ttl } => {
            ks.set(key, value, *ttl);
            Ok(Reply::Text("OK".to_owned()))
        }
        Command::Delete { keys } => {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            Ok(count_reply(ks.delete(&refs)))
        }
        Command::Increment { key, by } => Ok(Reply::Int(ks.increment(key, *by)?)),
        Command::Expire { key, ttl } => Ok(bool_reply(ks.expire(key, *ttl))),
        Command::ZAdd { key, member, score } => Ok(bool_reply(ks.zadd(key, member, *score)?)),
        Command::ZRem { key, members } => {
            let refs: Vec<&str> = members.iter().map(String::as_str).collect();
            Ok(count_reply(ks.zrem(key, &refs)?))
        }
        Command::ZRange { key, start, stop } => Ok(Reply::List(
            ks.zrange_by_rank(key, *start, *stop)?
                .into_iter()
                .map(|(member, _)| member)
                .collect(),
        )),
        Command::Push { key, end, items } => {
            let refs: Vec<&str> = items.iter().map(String::as_str).collect();
            Ok(count_reply(ks.push(key, *end, &refs)?))
        }
        Command::SetStore { op, dest, keys } => {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            Ok(count_reply(ks.set_op_store(*op, dest, &refs)?))
        }
    }
}
