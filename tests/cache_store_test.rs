//! Tests for the cache store over the in-process backend.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use muninn::cache::{Backend, CacheCategory, CacheConfig, CacheStore, derive_key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Passage {
    text: String,
    score: f64,
}

fn store() -> CacheStore {
    CacheStore::in_memory(CacheConfig::new())
}

#[test]
fn set_then_get_returns_value() {
    let store = store();
    let passage = Passage {
        text: "Wildfires are driven by drought".to_string(),
        score: 0.91,
    };
    assert!(store.set(CacheCategory::KnowledgeBase, "k1", &passage, None));

    let cached: Option<Passage> = store.get(CacheCategory::KnowledgeBase, "k1");
    assert_eq!(cached, Some(passage));
}

#[test]
fn miss_and_hit_are_counted() {
    let store = store();
    assert_eq!(store.get::<String>(CacheCategory::Stats, "absent"), None);
    store.set(CacheCategory::Stats, "present", "value", None);
    assert_eq!(
        store.get::<String>(CacheCategory::Stats, "present").as_deref(),
        Some("value")
    );

    let stats = store.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.hit_rate, 50.0);
    assert_eq!(stats.backend, Backend::Memory);
    assert_eq!(stats.memory_cache_size, Some(1));
    assert_eq!(stats.redis_keys, None);
}

#[test]
fn empty_store_has_zero_hit_rate() {
    let stats = store().stats();
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.hit_rate, 0.0);
}

#[test]
fn categories_do_not_share_entries() {
    let store = store();
    store.set(CacheCategory::Responses, "same-key", &1u32, None);
    assert_eq!(store.get::<u32>(CacheCategory::Stats, "same-key"), None);
    assert_eq!(store.get::<u32>(CacheCategory::Responses, "same-key"), Some(1));
}

#[test]
fn entries_expire_after_ttl() {
    let store = store();
    store.set(
        CacheCategory::Stats,
        "short",
        &"soon gone",
        Some(Duration::from_millis(50)),
    );
    assert!(store.contains(CacheCategory::Stats, "short"));

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(store.get::<String>(CacheCategory::Stats, "short"), None);
}

#[test]
fn zero_ttl_stores_nothing_retrievable() {
    let store = store();
    store.set(CacheCategory::Stats, "zero", &7u8, Some(Duration::ZERO));
    assert_eq!(store.get::<u8>(CacheCategory::Stats, "zero"), None);
}

#[test]
fn non_json_values_use_binary_codec() {
    let store = store();
    let mut grid: HashMap<(u8, u8), String> = HashMap::new();
    grid.insert((0, 1), "north".to_string());
    grid.insert((2, 3), "south".to_string());

    assert!(store.set(CacheCategory::Stats, "grid", &grid, None));
    let cached: Option<HashMap<(u8, u8), String>> = store.get(CacheCategory::Stats, "grid");
    assert_eq!(cached, Some(grid));
}

#[test]
fn non_finite_scores_survive_the_cache() {
    let store = store();
    let passages = vec![
        Passage {
            text: "unscored".to_string(),
            score: f64::NAN,
        },
        Passage {
            text: "certain".to_string(),
            score: f64::INFINITY,
        },
    ];

    assert!(store.set(CacheCategory::KnowledgeBase, "scores", &passages, None));
    let cached: Vec<Passage> = store
        .get(CacheCategory::KnowledgeBase, "scores")
        .expect("non-finite floats should read back");
    assert!(cached[0].score.is_nan());
    assert_eq!(cached[1].score, f64::INFINITY);
    assert_eq!(store.stats().errors, 0);
}

#[test]
fn decode_failure_is_a_miss_not_a_panic() {
    let store = store();
    store.set(CacheCategory::Stats, "text", &"not a number", None);
    assert_eq!(store.get::<u64>(CacheCategory::Stats, "text"), None);
    assert_eq!(store.stats().errors, 1);
}

#[test]
fn invalidate_pattern_removes_matching_entries() {
    let store = store();
    let oil = derive_key("detect_database_intent", "oil wells").unwrap();
    store.set(CacheCategory::IntentDetection, &oil, &"a", None);
    store.set(CacheCategory::Stats, "visits", &"b", None);
    store.set(CacheCategory::Responses, "answer", &"c", None);

    let removed = store.invalidate_pattern("intent_detection:");
    assert_eq!(removed, 1);
    assert!(!store.contains(CacheCategory::IntentDetection, &oil));
    assert!(store.contains(CacheCategory::Stats, "visits"));
}

#[test]
fn invalidate_without_matches_removes_nothing() {
    let store = store();
    store.set(CacheCategory::Stats, "visits", &1u8, None);
    assert_eq!(store.invalidate_pattern("nothing-like-this"), 0);
    assert!(store.contains(CacheCategory::Stats, "visits"));
}

#[test]
fn clear_all_empties_store_and_resets_counters() {
    let store = store();
    for category in CacheCategory::ALL {
        store.set(category, "k", &category.as_str(), None);
    }
    store.get::<String>(CacheCategory::Stats, "k");
    store.get::<String>(CacheCategory::Stats, "missing");

    assert!(store.clear_all());

    let stats = store.stats();
    assert_eq!((stats.hits, stats.misses, stats.errors), (0, 0, 0));
    assert_eq!(stats.memory_cache_size, Some(0));
    for category in CacheCategory::ALL {
        assert!(!store.contains(category, "k"));
    }
}

#[test]
fn unreachable_redis_falls_back_to_memory() {
    let config = CacheConfig::new()
        .redis_url("redis://127.0.0.1:1")
        .connect_timeout_secs(1);
    let store = CacheStore::connect(config);
    assert_eq!(store.backend(), Backend::Memory);

    store.set(CacheCategory::Stats, "k", &42u32, None);
    assert_eq!(store.get::<u32>(CacheCategory::Stats, "k"), Some(42));
}

#[tokio::test]
async fn connect_from_blocking_pool_inside_runtime() {
    let config = CacheConfig::new()
        .redis_url("redis://127.0.0.1:1")
        .connect_timeout_secs(1);
    let store = tokio::task::spawn_blocking(move || CacheStore::connect(config))
        .await
        .unwrap();
    assert_eq!(store.backend(), Backend::Memory);
}

#[test]
fn empty_redis_url_means_memory() {
    let store = CacheStore::connect(CacheConfig::new().redis_url(""));
    assert_eq!(store.backend(), Backend::Memory);
}

#[test]
fn category_ttl_override_applies() {
    let config = CacheConfig::new()
        .without_redis()
        .ttl(CacheCategory::Stats, Duration::ZERO);
    let store = CacheStore::in_memory(config);
    store.set(CacheCategory::Stats, "k", &1u8, None);
    assert_eq!(store.get::<u8>(CacheCategory::Stats, "k"), None);
}

#[test]
fn stats_serialize_backend_lowercase() {
    let json = serde_json::to_value(store().stats()).unwrap();
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["hit_rate"], 0.0);
}

#[tokio::test]
async fn async_path_without_redis_is_always_a_miss() {
    let store = store();
    assert!(!store.set_async(CacheCategory::Stats, "k", &1u8, None).await);
    assert_eq!(store.get_async::<u8>(CacheCategory::Stats, "k").await, None);
}
