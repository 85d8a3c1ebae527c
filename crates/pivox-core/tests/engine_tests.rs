//! Tests for engine assembly
//!
//! This module tests:
//! - Builder wiring with an injected store
//! - Config validation surfacing as fatal errors
//! - Analytics enablement

use std::sync::Arc;

use pivox_core::config::PivoxConfig;
use pivox_core::error::PivoxError;
use pivox_core::rotation::RotationKind;
use pivox_core::store::MemoryStore;
use pivox_core::Pivox;

fn test_config() -> PivoxConfig {
    let mut config = PivoxConfig::default();
    config.cache_dir = std::env::temp_dir().join("pivox-engine-tests");
    config
}

#[tokio::test]
async fn test_builder_wires_components() {
    let engine = Pivox::builder()
        .with_config(test_config())
        .with_store(Arc::new(MemoryStore::new()))
        .with_strategy(RotationKind::Weighted)
        .build()
        .await
        .unwrap();

    assert_eq!(engine.pool.strategy_kind(), RotationKind::Weighted);
    assert!(engine.pool.is_empty().await);
    assert!(engine.analytics.is_none());
    assert_eq!(engine.config.rate_limits.per_minute, 30);
}

#[tokio::test]
async fn test_invalid_config_is_fatal() {
    let mut config = test_config();
    config.sources = vec!["no-such-provider".to_string()];

    let err = Pivox::builder()
        .with_config(config)
        .with_store(Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, PivoxError::Config(_)));
}

#[tokio::test]
async fn test_analytics_enabled_by_config() {
    let mut config = test_config();
    config.analytics_enabled = true;

    let engine = Pivox::builder()
        .with_config(config)
        .with_store(Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap();

    let analytics = engine.analytics.as_ref().expect("analytics enabled");
    analytics.record_rotation();
    assert_eq!(analytics.snapshot().rotations, 1);
}

#[tokio::test]
async fn test_validated_default_is_true() {
    // The canonical builder default: rotated requests use validated
    // proxies unless the caller opts out.
    let engine = Pivox::builder()
        .with_config(test_config())
        .with_store(Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap();
    drop(engine);

    let defaults = pivox_core::RequestOptions::default();
    assert!(defaults.use_validated_proxies);
    assert!(defaults.rotate);
    assert_eq!(defaults.max_retries, 3);
}
