use std::time::Duration;

use crate::atomic::{AtomicOp, Reply, shard_key, shard_pointer_key};
use crate::error::StoreError;
use crate::store::{KeyTtl, KvStore, ListEnd, SetOp};
use crate::tx::{Command, TxResult};

/// Run the full key-value conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
///
/// # Errors
///
/// Returns an error if the backend fails an operation.
pub async fn run_store_conformance_tests(store: &dyn KvStore) -> Result<(), StoreError> {
    test_get_missing(store).await?;
    test_set_and_get(store).await?;
    test_set_if_absent(store).await?;
    test_delete_counts(store).await?;
    test_increment(store).await?;
    test_expire_and_ttl(store).await?;
    test_sorted_set_ordering(store).await?;
    test_sorted_set_ranges(store).await?;
    test_set_combinations(store).await?;
    test_list_ends(store).await?;
    test_blocking_pop_ready(store).await?;
    test_watch_commit(store).await?;
    test_watch_conflict(store).await?;
    test_multi_exec(store).await?;
    Ok(())
}

async fn test_get_missing(store: &dyn KvStore) -> Result<(), StoreError> {
    let val = store.get("conf:missing").await?;
    assert!(val.is_none(), "get on missing key should return None");
    Ok(())
}

async fn test_set_and_get(store: &dyn KvStore) -> Result<(), StoreError> {
    store.set("conf:set-get", "hello", None).await?;
    let val = store.get("conf:set-get").await?;
    assert_eq!(val.as_deref(), Some("hello"));
    Ok(())
}

async fn test_set_if_absent(store: &dyn KvStore) -> Result<(), StoreError> {
    let created = store.set_if_absent("conf:nx", "v1").await?;
    assert!(created, "set_if_absent on new key should return true");
    let created = store.set_if_absent("conf:nx", "v2").await?;
    assert!(!created, "set_if_absent on existing key should return false");
    assert_eq!(store.get("conf:nx").await?.as_deref(), Some("v1"));
    Ok(())
}

async fn test_delete_counts(store: &dyn KvStore) -> Result<(), StoreError> {
    store.set("conf:del-a", "a", None).await?;
    store.zadd("conf:del-b", "m", 1.0).await?;
    let removed = store
        .delete(&["conf:del-a", "conf:del-b", "conf:del-c"])
        .await?;
    assert_eq!(removed, 2, "delete should count only existing keys");
    assert_eq!(store.delete(&["conf:del-a"]).await?, 0);
    Ok(())
}

async fn test_increment(store: &dyn KvStore) -> Result<(), StoreError> {
    assert_eq!(store.increment("conf:counter", 1).await?, 1);
    assert_eq!(store.increment("conf:counter", 5).await?, 6);
    assert_eq!(store.increment("conf:counter", -2).await?, 4);
    Ok(())
}

async fn test_expire_and_ttl(store: &dyn KvStore) -> Result<(), StoreError> {
    assert_eq!(store.ttl("conf:ttl").await?, KeyTtl::Missing);
    store.set("conf:ttl", "v", None).await?;
    assert_eq!(store.ttl("conf:ttl").await?, KeyTtl::Persistent);

    assert!(store.expire("conf:ttl", Duration::from_secs(60)).await?);
    match store.ttl("conf:ttl").await? {
        KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(60)),
        other => panic!("expected an expiry, got {other:?}"),
    }

    assert!(!store.expire("conf:ttl-missing", Duration::from_secs(1)).await?);
    Ok(())
}

async fn test_sorted_set_ordering(store: &dyn KvStore) -> Result<(), StoreError> {
    let key = "conf:zset-order";
    assert!(store.zadd(key, "b", 0.0).await?);
    assert!(store.zadd(key, "a", 0.0).await?);
    assert!(store.zadd(key, "c", -1.0).await?);
    assert!(!store.zadd(key, "c", 5.0).await?, "update is not an insert");

    assert_eq!(store.zrank(key, "a").await?, Some(0), "ties order by member");
    assert_eq!(store.zrank(key, "b").await?, Some(1));
    assert_eq!(store.zrank(key, "c").await?, Some(2));
    assert_eq!(store.zrank(key, "zz").await?, None);
    assert_eq!(store.zscore(key, "c").await?, Some(5.0));
    assert_eq!(store.zcard(key).await?, 3);
    Ok(())
}

async fn test_sorted_set_ranges(store: &dyn KvStore) -> Result<(), StoreError> {
    let key = "conf:zset-range";
    for (member, score) in [("m0", 0.0), ("m1", 1.0), ("m2", 2.0), ("m3", 3.0), ("m4", 4.0)] {
        store.zadd(key, member, score).await?;
    }

    let tail: Vec<String> = store
        .zrange_by_rank(key, -2, -1)
        .await?
        .into_iter()
        .map(|(m, _)| m)
        .collect();
    assert_eq!(tail, ["m3", "m4"]);

    let mid = store.zrange_by_score(key, 1.0, 2.0).await?;
    assert_eq!(mid, [("m1".to_owned(), 1.0), ("m2".to_owned(), 2.0)]);

    assert_eq!(store.zrem_range_by_score(key, f64::NEG_INFINITY, 0.5).await?, 1);
    assert_eq!(store.zrem_range_by_rank(key, 0, 0).await?, 1);
    assert_eq!(store.zrem(key, &["m2", "missing"]).await?, 1);
    assert_eq!(store.zcard(key).await?, 2);
    Ok(())
}

async fn test_set_combinations(store: &dyn KvStore) -> Result<(), StoreError> {
    store.sadd("conf:set-a", &["x", "y", "z"]).await?;
    store.sadd("conf:set-b", &["y", "z", "w"]).await?;

    let expected = [
        (SetOp::Intersect, vec!["y", "z"]),
        (SetOp::Union, vec!["w", "x", "y", "z"]),
        (SetOp::Difference, vec!["x"]),
    ];
    for (op, members) in expected {
        let count = store
            .set_op_store(op, "conf:set-dest", &["conf:set-a", "conf:set-b"])
            .await?;
        assert_eq!(count, members.len() as u64, "{op} cardinality");
        assert_eq!(store.smembers("conf:set-dest").await?, members, "{op}");
    }
    Ok(())
}

async fn test_list_ends(store: &dyn KvStore) -> Result<(), StoreError> {
    let key = "conf:list";
    assert_eq!(store.push(key, ListEnd::Tail, &["a", "b"]).await?, 2);
    assert_eq!(store.push(key, ListEnd::Head, &["c", "d"]).await?, 4);
    // d c a b
    assert_eq!(store.llen(key).await?, 4);
    assert_eq!(store.pop(key, ListEnd::Head).await?.as_deref(), Some("d"));
    assert_eq!(store.pop(key, ListEnd::Tail).await?.as_deref(), Some("b"));
    assert_eq!(store.pop(key, ListEnd::Head).await?.as_deref(), Some("c"));
    assert_eq!(store.pop(key, ListEnd::Head).await?.as_deref(), Some("a"));
    assert_eq!(store.pop(key, ListEnd::Head).await?, None);
    assert_eq!(store.llen(key).await?, 0);
    Ok(())
}

async fn test_blocking_pop_ready(store: &dyn KvStore) -> Result<(), StoreError> {
    store.push("conf:bpop-b", ListEnd::Tail, &["item"]).await?;
    let popped = store
        .blocking_pop(
            &["conf:bpop-a", "conf:bpop-b"],
            ListEnd::Head,
            Duration::from_secs(1),
        )
        .await?;
    assert_eq!(popped, Some(("conf:bpop-b".to_owned(), "item".to_owned())));
    Ok(())
}

async fn test_watch_commit(store: &dyn KvStore) -> Result<(), StoreError> {
    store.set("conf:watch-ok", "1", None).await?;
    let mut session = store.watch(&["conf:watch-ok"]).await?;
    let current = session.get("conf:watch-ok").await?;
    assert_eq!(current.as_deref(), Some("1"));

    let result = session
        .exec(vec![
            Command::Set {
                key: "conf:watch-ok".into(),
                value: "2".into(),
                ttl: None,
            },
            Command::Increment {
                key: "conf:watch-ok".into(),
                by: 3,
            },
        ])
        .await?;
    assert_eq!(
        result,
        TxResult::Committed(vec![Reply::Text("OK".into()), Reply::Int(5)])
    );
    assert_eq!(store.get("conf:watch-ok").await?.as_deref(), Some("5"));
    Ok(())
}

async fn test_watch_conflict(store: &dyn KvStore) -> Result<(), StoreError> {
    store.set("conf:watch-conflict", "1", None).await?;
    let mut session = store.watch(&["conf:watch-conflict"]).await?;
    let _ = session.get("conf:watch-conflict").await?;

    // Another client writes the watched key.
    store.set("conf:watch-conflict", "other", None).await?;

    let result = session
        .exec(vec![Command::Delete {
            keys: vec!["conf:watch-conflict".into()],
        }])
        .await?;
    assert!(result.is_conflict(), "exec after a concurrent write must conflict");
    assert_eq!(
        store.get("conf:watch-conflict").await?.as_deref(),
        Some("other"),
        "nothing may be applied on conflict"
    );
    Ok(())
}

async fn test_multi_exec(store: &dyn KvStore) -> Result<(), StoreError> {
    let replies = store
        .multi_exec(vec![
            Command::ZAdd {
                key: "conf:multi".into(),
                member: "a".into(),
                score: 1.0,
            },
            Command::ZAdd {
                key: "conf:multi".into(),
                member: "b".into(),
                score: 2.0,
            },
            Command::ZRem {
                key: "conf:multi".into(),
                members: vec!["a".into()],
            },
            Command::ZRange {
                key: "conf:multi".into(),
                start: 0,
                stop: -1,
            },
        ])
        .await?;
    assert_eq!(
        replies,
        [
            Reply::Int(1),
            Reply::Int(1),
            Reply::Int(1),
            Reply::List(vec!["b".into()])
        ]
    );
    Ok(())
}

/// Run the atomic operation conformance test suite.
///
/// # Errors
///
/// Returns an error if the backend fails an operation.
pub async fn run_atomic_conformance_tests(store: &dyn KvStore) -> Result<(), StoreError> {
    test_lock_ops(store).await?;
    test_semaphore_ops(store).await?;
    test_fair_semaphore_ops(store).await?;
    test_sharded_push_pop(store).await?;
    test_sharded_pop_nudge(store).await?;
    Ok(())
}

async fn test_lock_ops(store: &dyn KvStore) -> Result<(), StoreError> {
    let acquire = |token: &str| AtomicOp::AcquireLock {
        key: "conf:lock".into(),
        token: token.into(),
        lease: Duration::from_secs(10),
    };
    assert_eq!(store.run_script(&acquire("t1")).await?, Reply::Int(1));
    assert_eq!(store.run_script(&acquire("t2")).await?, Reply::Int(0));
    assert!(matches!(store.ttl("conf:lock").await?, KeyTtl::Expires(_)));

    let release = |token: &str| AtomicOp::ReleaseLock {
        key: "conf:lock".into(),
        token: token.into(),
    };
    assert_eq!(store.run_script(&release("t2")).await?, Reply::Int(0));
    assert_eq!(store.run_script(&release("t1")).await?, Reply::Int(1));
    assert_eq!(store.run_script(&release("t1")).await?, Reply::Int(0));
    Ok(())
}

async fn test_semaphore_ops(store: &dyn KvStore) -> Result<(), StoreError> {
    let acquire = |token: &str, now_ms: i64| AtomicOp::AcquireSemaphore {
        key: "conf:sem".into(),
        token: token.into(),
        limit: 1,
        now_ms,
        cutoff_ms: now_ms - 1_000,
    };
    assert_eq!(
        store.run_script(&acquire("a", 10_000)).await?,
        Reply::Text("a".into())
    );
    assert_eq!(store.run_script(&acquire("b", 10_500)).await?, Reply::Nil);
    assert_eq!(store.zcard("conf:sem").await?, 1, "denied entry is removed");

    let refresh = AtomicOp::RefreshSemaphore {
        key: "conf:sem".into(),
        token: "a".into(),
        now_ms: 10_900,
    };
    assert_eq!(store.run_script(&refresh).await?, Reply::Int(1));

    // "a" was refreshed at 10_900, so it is still alive at 11_800.
    assert_eq!(store.run_script(&acquire("c", 11_800)).await?, Reply::Nil);
    // And dead at 12_000.
    assert_eq!(
        store.run_script(&acquire("c", 12_000)).await?,
        Reply::Text("c".into())
    );
    Ok(())
}

async fn test_fair_semaphore_ops(store: &dyn KvStore) -> Result<(), StoreError> {
    let acquire = |token: &str, now_ms: i64| AtomicOp::AcquireFairSemaphore {
        key: "conf:fair".into(),
        owner_key: "conf:fair:owner".into(),
        counter_key: "conf:fair:counter".into(),
        token: token.into(),
        limit: 1,
        now_ms,
        cutoff_ms: now_ms - 1_000,
    };

    // "a" has the later timestamp but the earlier ticket, and wins.
    assert_eq!(
        store.run_script(&acquire("a", 20_000)).await?,
        Reply::Text("a".into())
    );
    assert_eq!(store.run_script(&acquire("b", 19_500)).await?, Reply::Nil);
    assert_eq!(store.zcard("conf:fair:owner").await?, 1);

    let release = AtomicOp::ReleaseFairSemaphore {
        key: "conf:fair".into(),
        owner_key: "conf:fair:owner".into(),
        token: "a".into(),
    };
    assert_eq!(store.run_script(&release).await?, Reply::Int(1));
    assert_eq!(store.run_script(&release).await?, Reply::Int(0));
    assert_eq!(store.zcard("conf:fair:owner").await?, 0);

    let refresh_missing = AtomicOp::RefreshFairSemaphore {
        key: "conf:fair".into(),
        owner_key: "conf:fair:owner".into(),
        token: "a".into(),
        now_ms: 20_100,
    };
    assert_eq!(store.run_script(&refresh_missing).await?, Reply::Int(0));
    assert_eq!(
        store.zscore("conf:fair", "a").await?,
        None,
        "a failed refresh leaves no partial entry"
    );
    Ok(())
}

async fn test_sharded_push_pop(store: &dyn KvStore) -> Result<(), StoreError> {
    let items: Vec<String> = (0..5).map(|i| format!("i{i}")).collect();
    let push = AtomicOp::ShardedPush {
        queue: "conf:sq".into(),
        end: ListEnd::Tail,
        chunk_size: 3,
        items: items.clone(),
    };

    // Each shard holds chunk_size - 1 = 2 items.
    assert_eq!(store.run_script(&push).await?, Reply::Int(2));
    let rest = AtomicOp::ShardedPush {
        queue: "conf:sq".into(),
        end: ListEnd::Tail,
        chunk_size: 3,
        items: items[2..].to_vec(),
    };
    assert_eq!(store.run_script(&rest).await?, Reply::Int(2));
    assert_eq!(store.llen(&shard_key("conf:sq", 0)).await?, 2);
    assert_eq!(store.llen(&shard_key("conf:sq", 1)).await?, 2);
    assert_eq!(
        store
            .get(&shard_pointer_key("conf:sq", ListEnd::Tail))
            .await?
            .as_deref(),
        Some("1")
    );

    let pop = AtomicOp::ShardedPop {
        queue: "conf:sq".into(),
        end: ListEnd::Head,
    };
    let mut popped = Vec::new();
    while let Some(item) = store.run_script(&pop).await?.into_text() {
        popped.push(item);
    }
    assert_eq!(popped, items[..4].to_vec());
    Ok(())
}

async fn test_sharded_pop_nudge(store: &dyn KvStore) -> Result<(), StoreError> {
    let nudge = |observed: i64| AtomicOp::ShardedPopNudge {
        queue: "conf:nudge".into(),
        end: ListEnd::Head,
        observed,
        marker: "marker".into(),
    };
    assert_eq!(store.run_script(&nudge(0)).await?, Reply::Int(0));
    assert_eq!(store.llen(&shard_key("conf:nudge", 0)).await?, 0);

    store
        .set(&shard_pointer_key("conf:nudge", ListEnd::Head), "1", None)
        .await?;
    assert_eq!(store.run_script(&nudge(0)).await?, Reply::Int(1));
    assert_eq!(
        store
            .pop(&shard_key("conf:nudge", 0), ListEnd::Head)
            .await?
            .as_deref(),
        Some("marker")
    );
    Ok(())
}
