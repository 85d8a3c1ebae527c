//! Tests for the HTTP middleware
//!
//! This module tests:
//! - Proxy error classification and rotate-and-retry
//! - Score feedback from request outcomes
//! - Destination errors counting as proxy successes
//! - Direct fallback and the empty-pool contract

use std::sync::Arc;
use std::time::Duration;

use pivox_core::cache::TieredCache;
use pivox_core::client::{PivoxClient, RequestOptions};
use pivox_core::config::{PivoxConfig, RateLimitConfig};
use pivox_core::error::PivoxError;
use pivox_core::pool::ProxyPool;
use pivox_core::proxy::{Proxy, ProxyProtocol};
use pivox_core::rate_limit::RateLimiter;
use pivox_core::sources::SourceSet;
use pivox_core::store::MemoryStore;

// ============================================================================
// Test Fixtures
// ============================================================================

fn test_config() -> PivoxConfig {
    let mut config = PivoxConfig::default();
    config.default_timeout_ms = 1000;
    config.test_url = "http://probe.test/ip".to_string();
    config.refresh_interval_secs = 3600;
    config
}

fn make_pool() -> Arc<ProxyPool> {
    let config = test_config();
    let cache = Arc::new(TieredCache::new(config.cache, Arc::new(MemoryStore::new())));
    Arc::new(
        ProxyPool::with_sources(&config, cache, None, SourceSet::from_sources(Vec::new()))
            .unwrap(),
    )
}

fn plain_http_options(max_retries: u32) -> RequestOptions {
    RequestOptions {
        use_validated_proxies: false,
        rotate: true,
        max_retries,
        strategy: None,
        use_https: false,
    }
}

fn make_client(pool: Arc<ProxyPool>, direct_fallback: bool) -> PivoxClient {
    PivoxClient::new(
        pool,
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        None,
        plain_http_options(3),
        Duration::from_millis(1000),
        direct_fallback,
    )
}

fn proxy_for(server: &mockito::Server) -> Proxy {
    let address = server.host_with_port();
    let (host, port) = address.split_once(':').unwrap();
    Proxy::new(host, port.parse().unwrap(), ProxyProtocol::Http)
}

async fn mock_any(server: &mut mockito::Server, status: usize, body: &str) -> mockito::Mock {
    server
        .mock("GET", mockito::Matcher::Any)
        .with_status(status)
        .with_body(body)
        .create_async()
        .await
}

// ============================================================================
// Rotate-and-retry
// ============================================================================

#[tokio::test]
async fn test_407_rotates_to_working_proxy() {
    let mut rejecting = mockito::Server::new_async().await;
    let _m1 = mock_any(&mut rejecting, 407, "").await;
    let mut working = mockito::Server::new_async().await;
    let _m2 = mock_any(&mut working, 200, "hello").await;

    let pool = make_pool();
    let bad = proxy_for(&rejecting);
    let good = proxy_for(&working);
    pool.add_proxies(vec![bad.clone(), good.clone()]).await;

    let client = make_client(Arc::clone(&pool), false);
    let response = client.get("http://destination.test/page").await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");
    assert_eq!(response.proxy.as_ref().map(|p| p.key()), Some(good.key()));

    let bad_score = pool.score_of(&bad.key()).await.unwrap();
    assert_eq!(bad_score.consecutive_failures, 1);
    let good_score = pool.score_of(&good.key()).await.unwrap();
    assert_eq!(good_score.consecutive_successes, 1);
}

#[tokio::test]
async fn test_proxy_layer_503_rotates() {
    let mut flaky = mockito::Server::new_async().await;
    let _m1 = mock_any(&mut flaky, 503, "").await;
    let mut working = mockito::Server::new_async().await;
    let _m2 = mock_any(&mut working, 200, "ok").await;

    let pool = make_pool();
    pool.add_proxies(vec![proxy_for(&flaky), proxy_for(&working)]).await;

    let client = make_client(Arc::clone(&pool), false);
    let response = client.get("http://destination.test/").await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_unreachable_proxy_rotates() {
    let mut working = mockito::Server::new_async().await;
    let _m = mock_any(&mut working, 200, "ok").await;

    let pool = make_pool();
    let dead = Proxy::new("192.0.2.1", 8080, ProxyProtocol::Http);
    pool.add_proxies(vec![dead.clone(), proxy_for(&working)]).await;

    let client = make_client(Arc::clone(&pool), false);
    let response = client.get("http://destination.test/").await.unwrap();

    assert_eq!(response.status, 200);
    let dead_score = pool.score_of(&dead.key()).await.unwrap();
    assert_eq!(dead_score.failed_requests, 1);
}

// ============================================================================
// Destination outcomes
// ============================================================================

#[tokio::test]
async fn test_destination_error_is_proxy_success() {
    let mut upstream = mockito::Server::new_async().await;
    let _m = mock_any(&mut upstream, 404, "not here").await;

    let pool = make_pool();
    let p = proxy_for(&upstream);
    pool.add_proxies(vec![p.clone()]).await;

    let client = make_client(Arc::clone(&pool), false);
    let response = client.get("http://destination.test/missing").await.unwrap();

    // The destination said 404; the proxy still carried the request.
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
    let score = pool.score_of(&p.key()).await.unwrap();
    assert_eq!(score.consecutive_successes, 1);
    assert_eq!(score.failed_requests, 0);
}

// ============================================================================
// Empty pool behavior
// ============================================================================

#[tokio::test]
async fn test_direct_fallback_when_pool_empty() {
    let mut destination = mockito::Server::new_async().await;
    let _m = mock_any(&mut destination, 200, "direct").await;

    let pool = make_pool();
    let client = make_client(pool, true);

    let url = format!("{}/page", destination.url());
    let response = client.get(&url).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(response.proxy.is_none());
    assert_eq!(response.text(), "direct");
}

#[tokio::test]
async fn test_empty_pool_without_fallback_raises() {
    let pool = make_pool();
    let client = make_client(pool, false);

    let err = client.get("http://destination.test/").await.unwrap_err();
    assert!(matches!(err, PivoxError::NoProxiesAvailable));
}

#[tokio::test]
async fn test_invalid_url_is_config_error() {
    let pool = make_pool();
    let client = make_client(pool, false);
    let err = client.get("not a url").await.unwrap_err();
    assert!(matches!(err, PivoxError::Config(_)));
}
