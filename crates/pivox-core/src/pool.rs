//! The pool manager: authoritative owner of the proxy set.
//!
//! Orchestrates source refresh, validation, scoring and selection. Scores
//! live only here, keyed by proxy identity; other components refer to
//! proxies by key and come back through the pool for score state. All
//! score mutation happens under the pool's write lock, so updates for a
//! single proxy observe the order they were issued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::analytics::Analytics;
use crate::cache::TieredCache;
use crate::config::PivoxConfig;
use crate::error::{PivoxError, Result};
use crate::http::FetchClient;
use crate::proxy::{AnonymityLevel, Proxy, ProxyProtocol, ProxyScore, ProxyState};
use crate::rotation::{Candidate, RotationKind, RotationStrategy};
use crate::sources::SourceSet;
use crate::validator::{ValidationOutcome, Validator};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub count: usize,
    pub protocols: Option<Vec<ProxyProtocol>>,
    pub countries: Option<Vec<String>>,
    pub min_anonymity: Option<AnonymityLevel>,
    pub validated_only: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            count: 20,
            protocols: None,
            countries: None,
            min_anonymity: None,
            validated_only: false,
        }
    }
}

pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

struct PoolEntry {
    proxy: Proxy,
    score: ProxyScore,
    state: ProxyState,
    inserted_seq: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, PoolEntry>,
    insert_seq: u64,
}

impl PoolInner {
    fn insert_candidates(&mut self, batch: Vec<Proxy>) -> usize {
        let mut added = 0;
        for proxy in batch {
            let key = proxy.key();
            if self.entries.contains_key(&key) {
                continue;
            }
            self.insert_seq += 1;
            self.entries.insert(
                key,
                PoolEntry {
                    proxy,
                    score: ProxyScore::new(),
                    state: ProxyState::Unknown,
                    inserted_seq: self.insert_seq,
                },
            );
            added += 1;
        }
        added
    }
}

pub struct ProxyPool {
    inner: RwLock<PoolInner>,
    strategy: parking_lot::Mutex<RotationStrategy>,
    sources: Mutex<SourceSet>,
    fetch_client: FetchClient,
    validator: Validator,
    cache: Arc<TieredCache>,
    analytics: Option<Arc<Analytics>>,
    test_url: String,
    timeout: Duration,
    max_consecutive_failures: u32,
    refresh_interval: Duration,
    last_refresh: Mutex<Option<std::time::Instant>>,
}

impl ProxyPool {
    pub fn new(
        config: &PivoxConfig,
        cache: Arc<TieredCache>,
        analytics: Option<Arc<Analytics>>,
    ) -> Result<Self> {
        let sources = SourceSet::build(&config.sources)?;
        Self::with_sources(config, cache, analytics, sources)
    }

    /// Construct with a prebuilt source set, e.g. custom adapters.
    pub fn with_sources(
        config: &PivoxConfig,
        cache: Arc<TieredCache>,
        analytics: Option<Arc<Analytics>>,
        sources: SourceSet,
    ) -> Result<Self> {
        let fetch_client = FetchClient::new(config.default_timeout())?;
        Ok(Self {
            inner: RwLock::new(PoolInner::default()),
            strategy: parking_lot::Mutex::new(RotationStrategy::new(RotationKind::RoundRobin)),
            sources: Mutex::new(sources),
            fetch_client,
            validator: Validator::new(config.max_concurrent_validations),
            cache,
            analytics,
            test_url: config.test_url.clone(),
            timeout: config.default_timeout(),
            max_consecutive_failures: config.max_consecutive_failures,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            last_refresh: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Swap the rotation strategy; takes effect on the next selection.
    pub fn set_strategy(&self, kind: RotationKind) {
        *self.strategy.lock() = RotationStrategy::new(kind);
        info!(strategy = %kind, "rotation strategy changed");
    }

    pub fn strategy_kind(&self) -> RotationKind {
        self.strategy.lock().kind()
    }

    /// Seed proxies directly, bypassing the source adapters.
    pub async fn add_proxies(&self, proxies: Vec<Proxy>) -> usize {
        self.inner.write().await.insert_candidates(proxies)
    }

    /// Refresh from all enabled sources. Per-source failures are skipped;
    /// an all-sources-dry refresh simply adds nothing.
    pub async fn refresh(&self) -> usize {
        let (batch, counts) = {
            let mut sources = self.sources.lock().await;
            sources.fetch_all(&self.fetch_client).await
        };
        if let Some(analytics) = &self.analytics {
            for (source, count) in &counts {
                analytics.record_fetched(source, *count as u64);
            }
        }
        let added = self.inner.write().await.insert_candidates(batch);
        *self.last_refresh.lock().await = Some(std::time::Instant::now());
        info!(added, "pool refreshed from sources");
        added
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let last = self.last_refresh.lock().await;
            match *last {
                Some(at) => at.elapsed() >= self.refresh_interval,
                None => true,
            }
        };
        if stale || self.inner.read().await.entries.is_empty() {
            self.refresh().await;
        }
    }

    /// Up to `count` deduplicated candidates matching the filters. Total
    /// source failure yields an empty vec, never an error.
    pub async fn fetch(&self, options: &FetchOptions) -> Vec<Proxy> {
        self.refresh_if_stale().await;

        let inner = self.inner.read().await;
        let mut entries: Vec<&PoolEntry> = inner
            .entries
            .values()
            .filter(|e| e.state != ProxyState::Inactive)
            .filter(|e| Self::matches(e, options))
            .collect();
        entries.sort_by_key(|e| e.inserted_seq);
        entries
            .into_iter()
            .take(options.count)
            .map(|e| e.proxy.clone())
            .collect()
    }

    fn matches(entry: &PoolEntry, options: &FetchOptions) -> bool {
        if options.validated_only && entry.state != ProxyState::Active {
            return false;
        }
        if let Some(protocols) = &options.protocols {
            if !protocols.contains(&entry.proxy.protocol) {
                return false;
            }
        }
        if let Some(countries) = &options.countries {
            match &entry.proxy.metadata.country {
                Some(country) => {
                    if !countries.iter().any(|c| c.eq_ignore_ascii_case(country)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(min) = options.min_anonymity {
            match entry.proxy.metadata.anonymity {
                Some(level) if level >= min => {}
                _ => return false,
            }
        }
        true
    }

    /// Fetch candidates and return only those passing validation in this
    /// call. `on_progress` observes `(validated_so_far, total)`.
    pub async fn fetch_validated(
        &self,
        options: &FetchOptions,
        on_progress: Option<ProgressFn>,
    ) -> Vec<Proxy> {
        let mut candidate_options = options.clone();
        candidate_options.validated_only = false;
        // Probe more than requested since free proxies fail often.
        candidate_options.count = options.count.saturating_mul(3).max(options.count);

        let candidates = self.fetch(&candidate_options).await;
        let total = candidates.len();
        if total == 0 {
            return Vec::new();
        }

        {
            let mut inner = self.inner.write().await;
            for proxy in &candidates {
                if let Some(entry) = inner.entries.get_mut(&proxy.key()) {
                    entry.state = ProxyState::Validating;
                }
            }
        }

        let outcomes = self
            .validator
            .validate_batch(&candidates, &self.test_url, self.timeout)
            .await;

        let mut survivors = Vec::new();
        let mut done = 0;
        for (proxy, outcome) in outcomes {
            self.apply_validation(&proxy, &outcome).await;
            done += 1;
            if let Some(progress) = &on_progress {
                progress(done, total);
            }
            if outcome.valid && survivors.len() < options.count {
                survivors.push(proxy);
            }
        }
        debug!(survivors = survivors.len(), probed = total, "validated fetch complete");
        survivors
    }

    /// Select one proxy per the rotation strategy. Inactive proxies are
    /// never candidates; with `validated_only`, neither are unvalidated
    /// ones. Fails with `NoProxiesAvailable` on an empty candidate set.
    pub async fn next(
        &self,
        strategy_override: Option<RotationKind>,
        validated_only: bool,
    ) -> Result<Proxy> {
        let snapshot: Vec<Candidate> = {
            let inner = self.inner.read().await;
            let mut entries: Vec<&PoolEntry> = inner
                .entries
                .values()
                .filter(|e| match e.state {
                    ProxyState::Inactive => false,
                    ProxyState::Active => true,
                    ProxyState::Unknown | ProxyState::Validating => !validated_only,
                })
                .collect();
            entries.sort_by_key(|e| e.inserted_seq);
            entries
                .iter()
                .map(|e| Candidate {
                    proxy: e.proxy.clone(),
                    score: e.score.composite(),
                    last_used_epoch_ms: e.score.last_used_epoch_ms,
                })
                .collect()
        };

        if snapshot.is_empty() {
            return Err(PivoxError::NoProxiesAvailable);
        }

        let index = {
            let mut stored = self.strategy.lock();
            match strategy_override {
                Some(kind) if kind != stored.kind() => {
                    RotationStrategy::new(kind).select(&snapshot)
                }
                _ => stored.select(&snapshot),
            }
        }
        .ok_or(PivoxError::NoProxiesAvailable)?;

        let selected = snapshot[index].proxy.clone();
        {
            let mut inner = self.inner.write().await;
            if let Some(entry) = inner.entries.get_mut(&selected.key()) {
                entry.score.last_used_epoch_ms = chrono::Utc::now().timestamp_millis();
            }
        }
        if let Some(analytics) = &self.analytics {
            analytics.record_rotation();
        }
        Ok(selected)
    }

    /// Probe one proxy and fold the outcome into its score and state.
    pub async fn validate(&self, proxy: &Proxy) -> Result<bool> {
        {
            let mut inner = self.inner.write().await;
            inner.insert_candidates(vec![proxy.clone()]);
            if let Some(entry) = inner.entries.get_mut(&proxy.key()) {
                entry.state = ProxyState::Validating;
            }
        }
        let outcome = self.validator.validate(proxy, &self.test_url, self.timeout).await;
        self.apply_validation(proxy, &outcome).await;
        Ok(outcome.valid)
    }

    /// Apply a validation outcome produced elsewhere (the preloader runs
    /// its own validator on a separate budget).
    pub async fn apply_validation(&self, proxy: &Proxy, outcome: &ValidationOutcome) {
        if let Some(analytics) = &self.analytics {
            analytics.record_validation(outcome.valid);
        }
        if outcome.valid {
            self.record_success(proxy, outcome.latency_ms.unwrap_or(0)).await;
        } else {
            let key = proxy.key();
            let composite = {
                let mut inner = self.inner.write().await;
                inner.insert_candidates(vec![proxy.clone()]);
                let entry = inner.entries.get_mut(&key).expect("entry just inserted");
                entry.score.record_failure();
                entry.state = ProxyState::Inactive;
                entry.score.composite()
            };
            debug!(proxy = %proxy, "validation failed, proxy inactive");
            if let Err(e) = self.cache.update_score(&key, composite, None).await {
                warn!(error = %e, "failed to persist score update");
            }
        }
    }

    /// Atomic score update for a successful request: increment successes,
    /// fold latency into the EMA, clear the failure streak, reactivate.
    pub async fn record_success(&self, proxy: &Proxy, latency_ms: u64) {
        let key = proxy.key();
        let (composite, avg_latency) = {
            let mut inner = self.inner.write().await;
            inner.insert_candidates(vec![proxy.clone()]);
            let entry = inner.entries.get_mut(&key).expect("entry just inserted");
            entry.score.record_success(latency_ms);
            entry.state = ProxyState::Active;
            (entry.score.composite(), entry.score.avg_response_time_ms as u64)
        };
        if let Some(analytics) = &self.analytics {
            analytics.record_request(true);
        }
        if let Err(e) = self
            .cache
            .add(proxy.clone(), composite, Some(avg_latency))
            .await
        {
            warn!(error = %e, "failed to persist cache entry");
        }
    }

    /// Atomic score update for a failed request: increment failures, clear
    /// the success streak, deactivate past the consecutive-failure bound.
    pub async fn record_failure(&self, proxy: &Proxy) {
        let key = proxy.key();
        let composite = {
            let mut inner = self.inner.write().await;
            inner.insert_candidates(vec![proxy.clone()]);
            let entry = inner.entries.get_mut(&key).expect("entry just inserted");
            entry.score.record_failure();
            if entry.score.consecutive_failures >= self.max_consecutive_failures {
                if entry.state != ProxyState::Inactive {
                    warn!(
                        proxy = %proxy,
                        failures = entry.score.consecutive_failures,
                        "proxy deactivated after consecutive failures"
                    );
                }
                entry.state = ProxyState::Inactive;
            }
            entry.score.composite()
        };
        if let Some(analytics) = &self.analytics {
            analytics.record_request(false);
        }
        if let Err(e) = self.cache.update_score(&key, composite, None).await {
            warn!(error = %e, "failed to persist score update");
        }
    }

    pub async fn score_of(&self, key: &str) -> Option<ProxyScore> {
        self.inner.read().await.entries.get(key).map(|e| e.score.clone())
    }

    pub async fn state_of(&self, key: &str) -> Option<ProxyState> {
        self.inner.read().await.entries.get(key).map(|e| e.state)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.state == ProxyState::Active)
            .count()
    }

    pub async fn source_names(&self) -> Vec<&'static str> {
        self.sources.lock().await.names()
    }
}
