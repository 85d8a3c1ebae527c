//! Optional usage counters, persisted to the key-value store.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::store::{keys, KeyValueStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub fetched_by_source: HashMap<String, u64>,
    pub validations_passed: u64,
    pub validations_failed: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub rotations: u64,
}

pub struct Analytics {
    inner: parking_lot::RwLock<AnalyticsSnapshot>,
    store: Arc<dyn KeyValueStore>,
}

impl Analytics {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: parking_lot::RwLock::new(AnalyticsSnapshot::default()),
            store,
        }
    }

    pub fn record_fetched(&self, source: &str, count: u64) {
        *self
            .inner
            .write()
            .fetched_by_source
            .entry(source.to_string())
            .or_insert(0) += count;
    }

    pub fn record_validation(&self, passed: bool) {
        let mut inner = self.inner.write();
        if passed {
            inner.validations_passed += 1;
        } else {
            inner.validations_failed += 1;
        }
    }

    pub fn record_request(&self, succeeded: bool) {
        let mut inner = self.inner.write();
        if succeeded {
            inner.requests_succeeded += 1;
        } else {
            inner.requests_failed += 1;
        }
    }

    pub fn record_rotation(&self) {
        self.inner.write().rotations += 1;
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.inner.read().clone()
    }

    pub async fn persist(&self) -> Result<()> {
        let serialized = serde_json::to_string(&self.snapshot())
            .unwrap_or_else(|_| "{}".to_string());
        self.store.put(keys::ANALYTICS, &serialized).await
    }

    pub async fn load(&self) {
        match self.store.get(keys::ANALYTICS).await {
            Ok(Some(raw)) => {
                if let Ok(snapshot) = serde_json::from_str(&raw) {
                    *self.inner.write() = snapshot;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load analytics"),
        }
    }
}
