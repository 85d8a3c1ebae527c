//! Tests for the tiered cache
//!
//! This module tests:
//! - Tier capacity enforcement and the demotion chain
//! - Tier uniqueness invariants
//! - Persistence round-trips through the key-value store
//! - Accessor ordering

use std::sync::Arc;

use pivox_core::cache::{CacheTier, TieredCache};
use pivox_core::config::CacheConfig;
use pivox_core::proxy::{Proxy, ProxyProtocol};
use pivox_core::store::{KeyValueStore, MemoryStore};

// ============================================================================
// Test Fixtures
// ============================================================================

fn proxy(host: &str) -> Proxy {
    Proxy::new(host, 8080, ProxyProtocol::Http)
}

fn tiny_config() -> CacheConfig {
    CacheConfig {
        primary_capacity: 1,
        secondary_capacity: 1,
        tertiary_capacity: 1,
    }
}

fn cache_with(config: CacheConfig) -> TieredCache {
    TieredCache::new(config, Arc::new(MemoryStore::new()))
}

async fn use_n_times(cache: &TieredCache, host: &str, n: usize) {
    for _ in 0..n {
        cache.add(proxy(host), 0.5, Some(100)).await.unwrap();
    }
}

// ============================================================================
// Tier invariants
// ============================================================================

#[tokio::test]
async fn test_total_bounded_by_capacities() {
    let cache = cache_with(CacheConfig {
        primary_capacity: 2,
        secondary_capacity: 3,
        tertiary_capacity: 4,
    });
    for i in 0..30 {
        let host = format!("10.0.0.{i}");
        use_n_times(&cache, &host, (i % 12) + 1).await;
    }
    let stats = cache.stats();
    assert!(stats.primary <= 2);
    assert!(stats.secondary <= 3);
    assert!(stats.tertiary <= 4);
    assert!(stats.total() <= 9);
    // Each proxy appears in exactly one tier.
    assert_eq!(stats.total(), cache.len());
}

#[tokio::test]
async fn test_demotion_chain() {
    // Two proxies promoted to primary, then a third: the newest winner
    // keeps primary, the displaced one demotes, the oldest falls to the
    // bottom tier.
    let cache = cache_with(tiny_config());
    use_n_times(&cache, "1.1.1.1", 10).await;
    use_n_times(&cache, "2.2.2.2", 10).await;
    use_n_times(&cache, "3.3.3.3", 10).await;

    let primary = cache.get_tier(CacheTier::Primary);
    let secondary = cache.get_tier(CacheTier::Secondary);
    let tertiary = cache.get_tier(CacheTier::Tertiary);
    assert_eq!(primary.len(), 1);
    assert_eq!(secondary.len(), 1);
    assert_eq!(tertiary.len(), 1);
    assert_eq!(primary[0].proxy.host, "3.3.3.3");
    assert_eq!(secondary[0].proxy.host, "2.2.2.2");
    assert_eq!(tertiary[0].proxy.host, "1.1.1.1");
}

#[tokio::test]
async fn test_bottom_tier_overflow_dropped() {
    let cache = cache_with(tiny_config());
    use_n_times(&cache, "1.1.1.1", 1).await;
    use_n_times(&cache, "2.2.2.2", 1).await;
    assert_eq!(cache.len(), 1);
    assert!(cache.contains("2.2.2.2:8080"));
    assert!(!cache.contains("1.1.1.1:8080"));
}

// ============================================================================
// Accessors
// ============================================================================

#[tokio::test]
async fn test_get_best_orders_by_score() {
    let cache = cache_with(CacheConfig::default());
    cache.add(proxy("1.1.1.1"), 0.2, None).await.unwrap();
    cache.add(proxy("2.2.2.2"), 0.9, None).await.unwrap();
    cache.add(proxy("3.3.3.3"), 0.5, None).await.unwrap();

    let best = cache.get_best(2);
    assert_eq!(best.len(), 2);
    assert_eq!(best[0].proxy.host, "2.2.2.2");
    assert_eq!(best[1].proxy.host, "3.3.3.3");
}

#[tokio::test]
async fn test_most_frequent_and_recent() {
    let cache = cache_with(CacheConfig::default());
    use_n_times(&cache, "1.1.1.1", 5).await;
    use_n_times(&cache, "2.2.2.2", 2).await;

    assert_eq!(cache.get_most_frequent(1)[0].proxy.host, "1.1.1.1");
    assert_eq!(cache.get_most_recent(1)[0].proxy.host, "2.2.2.2");
}

#[tokio::test]
async fn test_clear() {
    let cache = cache_with(CacheConfig::default());
    use_n_times(&cache, "1.1.1.1", 3).await;
    cache.clear().await.unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.stats().total(), 0);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_persist_reload_round_trip() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let original = TieredCache::new(CacheConfig::default(), store.clone() as Arc<dyn KeyValueStore>);
    use_n_times(&original, "1.1.1.1", 12).await;
    use_n_times(&original, "2.2.2.2", 4).await;
    original.add(proxy("3.3.3.3"), 0.7, Some(250)).await.unwrap();

    let reloaded = TieredCache::new(CacheConfig::default(), store as Arc<dyn KeyValueStore>);
    let count = reloaded.load().await.unwrap();
    assert_eq!(count, 3);

    let stats = reloaded.stats();
    assert_eq!(stats.primary, 1);
    assert_eq!(stats.secondary, 1);
    assert_eq!(stats.tertiary, 1);

    // Preserved fields survive the round trip.
    let best = reloaded.get_best(1);
    assert_eq!(best[0].proxy.host, "3.3.3.3");
    assert!((best[0].score - 0.7).abs() < 1e-9);
    assert_eq!(best[0].response_time_ms, Some(250));
    let frequent = reloaded.get_most_frequent(1);
    assert_eq!(frequent[0].proxy.host, "1.1.1.1");
    assert_eq!(frequent[0].usage_count, 12);
}

#[tokio::test]
async fn test_reload_ignores_unknown_fields() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(
            "pivox.cache.primary",
            r#"[{"ip":"9.9.9.9","port":3128,"protocol":"http","is_https":false,"brand_new_field":42}]"#,
        )
        .await
        .unwrap();

    let cache = TieredCache::new(CacheConfig::default(), store);
    assert_eq!(cache.load().await.unwrap(), 1);
    assert!(cache.contains("9.9.9.9:3128"));
}
