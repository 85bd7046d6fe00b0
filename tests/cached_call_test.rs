//! Tests for the cacheable-call wrappers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;

use muninn::cache::{
    AsyncCachedCall, CacheCategory, CacheConfig, CacheStore, CachedCall, CallArgs, derive_key,
};

fn store() -> Arc<CacheStore> {
    Arc::new(CacheStore::in_memory(CacheConfig::new()))
}

#[test]
fn repeated_call_runs_operation_once() {
    let store = store();
    let calls = AtomicU32::new(0);
    let double: CachedCall<u32, u32> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "double");

    let op = |n: u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        n * 2
    };
    assert_eq!(double.call(&21, || op(21)), 42);
    assert_eq!(double.call(&21, || op(21)), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(double.call(&5, || op(5)), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn wrappers_with_different_identities_do_not_collide() {
    let store = store();
    let a: CachedCall<str, String> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "upper");
    let b: CachedCall<str, String> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "lower");

    assert_eq!(a.call("MiXeD", || "MIXED".to_string()), "MIXED");
    assert_eq!(b.call("MiXeD", || "mixed".to_string()), "mixed");
    assert_ne!(a.key_for("MiXeD"), b.key_for("MiXeD"));
}

#[test]
fn key_matches_derive_key() {
    let store = store();
    let call: CachedCall<str, String> =
        CachedCall::new(store, CacheCategory::IntentDetection, "detect_database_intent");
    assert_eq!(
        call.key_for("How many websites mention oil?"),
        Some(derive_key("detect_database_intent", "How many websites mention oil?").unwrap())
    );
}

#[test]
fn keyword_order_does_not_change_key() {
    let first = CallArgs::new()
        .arg(&"query")
        .unwrap()
        .kwarg("limit", &5)
        .unwrap()
        .kwarg("kb", &"kb-1")
        .unwrap();
    let second = CallArgs::new()
        .arg(&"query")
        .unwrap()
        .kwarg("kb", &"kb-1")
        .unwrap()
        .kwarg("limit", &5)
        .unwrap();
    assert_eq!(
        derive_key("get_contexts", &first).unwrap(),
        derive_key("get_contexts", &second).unwrap()
    );
}

#[test]
fn try_call_does_not_cache_errors() {
    let store = store();
    let attempts = AtomicU32::new(0);
    let fetch: CachedCall<str, String> =
        CachedCall::new(Arc::clone(&store), CacheCategory::KnowledgeBase, "fetch");

    let failed: Result<String, &str> = fetch.try_call("doc", || {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err("upstream down")
    });
    assert_eq!(failed, Err("upstream down"));
    assert!(!fetch.is_cached("doc"));

    let ok: Result<String, &str> = fetch.try_call("doc", || {
        attempts.fetch_add(1, Ordering::SeqCst);
        Ok("body".to_string())
    });
    assert_eq!(ok.as_deref(), Ok("body"));
    assert!(fetch.is_cached("doc"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn custom_key_fn_replaces_hashing() {
    let store = store();
    let call: CachedCall<String, usize> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "len")
            .key_fn(|s: &String| format!("len:{}", s.to_lowercase()));

    assert_eq!(call.call(&"ABC".to_string(), || 3), 3);
    // Same custom key, so the second closure is not run.
    assert_eq!(call.call(&"abc".to_string(), || 999), 3);
    assert_eq!(store.get::<usize>(CacheCategory::Stats, "len:abc"), Some(3));
}

#[test]
fn explicit_ttl_overrides_category() {
    let store = store();
    let call: CachedCall<u8, u8> = CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "f")
        .ttl(Duration::from_millis(50));

    call.call(&1, || 1);
    assert!(call.is_cached(&1));
    std::thread::sleep(Duration::from_millis(150));
    assert!(!call.is_cached(&1));
}

#[derive(Serialize)]
struct Unkeyable {
    grid: HashMap<(u8, u8), u8>,
}

#[test]
fn unkeyable_arguments_bypass_cache() {
    let store = store();
    let calls = AtomicU32::new(0);
    let call: CachedCall<Unkeyable, u32> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "grid_sum");
    let args = Unkeyable {
        grid: HashMap::from([((0, 0), 1)]),
    };

    assert_eq!(call.key_for(&args), None);
    for _ in 0..2 {
        call.call(&args, || {
            calls.fetch_add(1, Ordering::SeqCst);
            1
        });
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.stats().memory_cache_size, Some(0));
}

#[test]
fn cached_none_is_a_hit() {
    let store = store();
    let calls = AtomicU32::new(0);
    let call: CachedCall<str, Option<String>> =
        CachedCall::new(Arc::clone(&store), CacheCategory::IntentDetection, "classify");

    for _ in 0..3 {
        let value = call.call("hello there", || {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert_eq!(value, None);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn async_wrapper_without_redis_always_runs() {
    let store = store();
    let calls = Arc::new(AtomicU32::new(0));
    let call: AsyncCachedCall<str, u32> =
        AsyncCachedCall::new(Arc::clone(&store), CacheCategory::Stats, "remote");

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let value = call
            .call("x", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                7
            })
            .await;
        assert_eq!(value, 7);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn blocking_wrapper_from_blocking_pool() {
    let store = store();
    let call: CachedCall<u64, u64> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "square");

    let first = {
        let call = call.clone();
        tokio::task::spawn_blocking(move || call.call(&9, || 81))
            .await
            .unwrap()
    };
    let second = tokio::task::spawn_blocking(move || call.call(&9, || unreachable!()))
        .await
        .unwrap();
    assert_eq!((first, second), (81, 81));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_misses_all_complete() {
    const CALLERS: u32 = 8;
    let store = store();
    let call: CachedCall<str, String> =
        CachedCall::new(Arc::clone(&store), CacheCategory::Responses, "slow_answer");
    let executions = Arc::new(AtomicU32::new(0));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..CALLERS {
        let call = call.clone();
        let executions = Arc::clone(&executions);
        tasks.spawn_blocking(move || {
            call.call("same question", || {
                executions.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                "answer".to_string()
            })
        });
    }

    let results = tokio::time::timeout(Duration::from_secs(5), async {
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap());
        }
        results
    })
    .await
    .expect("concurrent callers should not deadlock");

    assert_eq!(results.len(), CALLERS as usize);
    assert!(results.iter().all(|r| r == "answer"));
    // No miss coalescing: duplicate execution is allowed.
    let executions = executions.load(Ordering::SeqCst);
    assert!((1..=CALLERS).contains(&executions), "{executions} executions");

    // Afterwards the value is cached.
    assert_eq!(call.call("same question", || unreachable!()), "answer");
}
