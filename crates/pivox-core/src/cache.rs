//! Usage-tiered proxy cache backed by the key-value store.
//!
//! Three tiers keep the most-used proxies hot. Tier membership derives
//! from usage; overflow demotes the least-recently-used entry down a
//! tier and the bottom tier's overflow is dropped. Every mutation
//! persists the tiers and the usage map; startup reload is atomic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::proxy::{AnonymityLevel, Proxy, ProxyMetadata, ProxyProtocol};
use crate::store::{keys, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Primary,
    Secondary,
    Tertiary,
}

impl CacheTier {
    /// Tier derived from usage frequency.
    pub fn for_usage(usage_count: u64) -> Self {
        if usage_count >= 10 {
            CacheTier::Primary
        } else if usage_count >= 3 {
            CacheTier::Secondary
        } else {
            CacheTier::Tertiary
        }
    }

    fn lower(&self) -> Option<CacheTier> {
        match self {
            CacheTier::Primary => Some(CacheTier::Secondary),
            CacheTier::Secondary => Some(CacheTier::Tertiary),
            CacheTier::Tertiary => None,
        }
    }

    fn store_key(&self) -> &'static str {
        match self {
            CacheTier::Primary => keys::CACHE_PRIMARY,
            CacheTier::Secondary => keys::CACHE_SECONDARY,
            CacheTier::Tertiary => keys::CACHE_TERTIARY,
        }
    }

    const ALL: [CacheTier; 3] = [CacheTier::Primary, CacheTier::Secondary, CacheTier::Tertiary];
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub proxy: Proxy,
    pub score: f64,
    pub usage_count: u64,
    pub last_accessed_epoch_ms: i64,
    pub response_time_ms: Option<u64>,
    pub tier: CacheTier,
    /// Monotonic touch counter; recency ties on wall-clock milliseconds
    /// resolve deterministically through it.
    touch_seq: u64,
}

/// Persisted shape. The schema is additive: unknown fields are ignored on
/// read and entries missing required fields are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    ip: String,
    port: u16,
    protocol: String,
    is_https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    anonymity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_checked_epoch_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            ip: entry.proxy.host.clone(),
            port: entry.proxy.port,
            protocol: entry.proxy.protocol.as_str().to_string(),
            is_https: entry.proxy.protocol.supports_https(),
            country_code: entry.proxy.metadata.country.clone(),
            anonymity_level: entry.proxy.metadata.anonymity.map(|a| a.as_str().to_string()),
            last_checked_epoch_ms: Some(entry.last_accessed_epoch_ms),
            response_time_ms: entry.response_time_ms,
            score: Some(entry.score),
        }
    }

    fn into_entry(self, tier: CacheTier, usage_count: u64, touch_seq: u64) -> Option<CacheEntry> {
        let protocol = ProxyProtocol::parse(&self.protocol)?;
        if self.port == 0 {
            return None;
        }
        let proxy = Proxy::new(self.ip, self.port, protocol).with_metadata(ProxyMetadata {
            country: self.country_code,
            region: None,
            isp: None,
            anonymity: self.anonymity_level.as_deref().and_then(AnonymityLevel::parse),
        });
        Some(CacheEntry {
            proxy,
            score: self.score.unwrap_or(0.0),
            usage_count,
            last_accessed_epoch_ms: self
                .last_checked_epoch_ms
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            response_time_ms: self.response_time_ms,
            tier,
            touch_seq,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub primary: usize,
    pub secondary: usize,
    pub tertiary: usize,
    pub total_usage: u64,
}

impl CacheStats {
    pub fn total(&self) -> usize {
        self.primary + self.secondary + self.tertiary
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

pub struct TieredCache {
    inner: parking_lot::RwLock<CacheInner>,
    capacities: CacheConfig,
    store: Arc<dyn KeyValueStore>,
}

impl TieredCache {
    pub fn new(capacities: CacheConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: parking_lot::RwLock::new(CacheInner::default()),
            capacities,
            store,
        }
    }

    fn capacity(&self, tier: CacheTier) -> usize {
        match tier {
            CacheTier::Primary => self.capacities.primary_capacity,
            CacheTier::Secondary => self.capacities.secondary_capacity,
            CacheTier::Tertiary => self.capacities.tertiary_capacity,
        }
    }

    /// Record a use of `proxy`: bump usage, recompute its tier, rebalance
    /// overflowing tiers, persist.
    pub async fn add(&self, proxy: Proxy, score: f64, response_time_ms: Option<u64>) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let now = Utc::now().timestamp_millis();
            let entry = inner
                .entries
                .entry(proxy.key())
                .or_insert_with(|| CacheEntry {
                    proxy,
                    score,
                    usage_count: 0,
                    last_accessed_epoch_ms: now,
                    response_time_ms,
                    tier: CacheTier::Tertiary,
                    touch_seq: seq,
                });
            entry.usage_count += 1;
            entry.last_accessed_epoch_ms = now;
            entry.touch_seq = seq;
            entry.score = score;
            if response_time_ms.is_some() {
                entry.response_time_ms = response_time_ms;
            }
            entry.tier = CacheTier::for_usage(entry.usage_count);
            Self::rebalance(&mut inner.entries, &self.capacities);
        }
        self.persist().await
    }

    /// Demote each overflowing tier's least-recently-used entries downward;
    /// tertiary overflow is evicted outright.
    fn rebalance(entries: &mut HashMap<String, CacheEntry>, capacities: &CacheConfig) {
        for tier in CacheTier::ALL {
            let capacity = match tier {
                CacheTier::Primary => capacities.primary_capacity,
                CacheTier::Secondary => capacities.secondary_capacity,
                CacheTier::Tertiary => capacities.tertiary_capacity,
            };
            loop {
                let count = entries.values().filter(|e| e.tier == tier).count();
                if count <= capacity {
                    break;
                }
                let lru_key = entries
                    .values()
                    .filter(|e| e.tier == tier)
                    .min_by_key(|e| e.touch_seq)
                    .map(|e| e.proxy.key());
                let Some(key) = lru_key else { break };
                match tier.lower() {
                    Some(lower) => {
                        if let Some(entry) = entries.get_mut(&key) {
                            entry.tier = lower;
                        }
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
            }
        }
    }

    pub fn get_tier(&self, tier: CacheTier) -> Vec<CacheEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries.values().filter(|e| e.tier == tier).cloned().collect();
        entries.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        entries
    }

    pub fn get_most_frequent(&self, n: usize) -> Vec<CacheEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        entries.truncate(n);
        entries
    }

    pub fn get_most_recent(&self, n: usize) -> Vec<CacheEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.touch_seq.cmp(&a.touch_seq));
        entries.truncate(n);
        entries
    }

    pub fn get_best(&self, n: usize) -> Vec<CacheEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(n);
        entries
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let mut stats = CacheStats::default();
        for entry in inner.entries.values() {
            match entry.tier {
                CacheTier::Primary => stats.primary += 1,
                CacheTier::Secondary => stats.secondary += 1,
                CacheTier::Tertiary => stats.tertiary += 1,
            }
            stats.total_usage += entry.usage_count;
        }
        stats
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh the cached score copy for an entry, if present.
    pub async fn update_score(&self, key: &str, score: f64, response_time_ms: Option<u64>) -> Result<()> {
        let updated = {
            let mut inner = self.inner.write();
            match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.score = score;
                    if response_time_ms.is_some() {
                        entry.response_time_ms = response_time_ms;
                    }
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await?;
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.inner.write().entries.clear();
        self.persist().await
    }

    /// Replace in-memory state from the store in one swap. Entries that
    /// fail to deserialize are dropped; a proxy found in several tiers
    /// keeps its highest placement.
    pub async fn load(&self) -> Result<usize> {
        let usage: HashMap<String, u64> = match self.store.get(keys::CACHE_STATS).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => HashMap::new(),
        };

        let mut entries = HashMap::new();
        let mut seq = 0u64;
        for tier in CacheTier::ALL {
            let Some(raw) = self.store.get(tier.store_key()).await? else {
                continue;
            };
            let values: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap_or_default();
            for value in values {
                let Ok(stored) = serde_json::from_value::<StoredEntry>(value) else {
                    continue;
                };
                let key = format!("{}:{}", stored.ip, stored.port);
                if entries.contains_key(&key) {
                    continue;
                }
                seq += 1;
                let usage_count = usage.get(&key).copied().unwrap_or(1);
                if let Some(entry) = stored.into_entry(tier, usage_count, seq) {
                    entries.insert(key, entry);
                }
            }
        }

        let count = entries.len();
        {
            let mut inner = self.inner.write();
            inner.entries = entries;
            inner.next_seq = seq;
        }
        debug!(count, "cache reloaded from store");
        Ok(count)
    }

    async fn persist(&self) -> Result<()> {
        let (tiers, stats) = {
            let inner = self.inner.read();
            let mut tiers: HashMap<CacheTier, Vec<StoredEntry>> = HashMap::new();
            let mut stats: HashMap<String, u64> = HashMap::new();
            for entry in inner.entries.values() {
                tiers.entry(entry.tier).or_default().push(StoredEntry::from_entry(entry));
                stats.insert(entry.proxy.key(), entry.usage_count);
            }
            (tiers, stats)
        };

        for tier in CacheTier::ALL {
            let serialized = serde_json::to_string(tiers.get(&tier).map(Vec::as_slice).unwrap_or(&[]))
                .unwrap_or_else(|_| "[]".to_string());
            if let Err(e) = self.store.put(tier.store_key(), &serialized).await {
                warn!(error = %e, tier = ?tier, "failed to persist cache tier");
                return Err(e);
            }
        }
        let serialized = serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string());
        self.store.put(keys::CACHE_STATS, &serialized).await
    }
}
