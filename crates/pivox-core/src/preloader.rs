//! Background pool warming and tier revalidation.
//!
//! Runs off the critical path with its own validation budget so periodic
//! sweeps never starve foreground probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheTier;
use crate::pool::{FetchOptions, ProxyPool};
use crate::proxy::Proxy;
use crate::validator::Validator;

/// Entries revalidated per sweep beyond the full primary tier.
const SECONDARY_SAMPLE: usize = 20;
const TERTIARY_SAMPLE: usize = 10;

/// Candidates probed during the initial fill.
const INITIAL_FILL_COUNT: usize = 50;

pub struct Preloader {
    pool: Arc<ProxyPool>,
    validator: Arc<Validator>,
    validation_interval: Duration,
    test_url: String,
    timeout: Duration,
    running: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Preloader {
    pub fn new(
        pool: Arc<ProxyPool>,
        max_concurrent_validations: usize,
        validation_interval: Duration,
        test_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            validator: Arc::new(Validator::new(max_concurrent_validations)),
            validation_interval,
            test_url,
            timeout,
            running: Arc::new(AtomicBool::new(false)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);

        let pool = Arc::clone(&self.pool);
        let validator = Arc::clone(&self.validator);
        let running = Arc::clone(&self.running);
        let interval = self.validation_interval;
        let test_url = self.test_url.clone();
        let timeout = self.timeout;

        *handle = Some(tokio::spawn(async move {
            info!("preloader starting initial fill");
            pool.refresh().await;
            let candidates = pool
                .fetch(&FetchOptions {
                    count: INITIAL_FILL_COUNT,
                    ..FetchOptions::default()
                })
                .await;
            Self::revalidate(&pool, &validator, candidates, &test_url, timeout).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, the fill just ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let batch = Self::sweep_targets(&pool);
                info!(count = batch.len(), "preloader revalidation sweep");
                Self::revalidate(&pool, &validator, batch, &test_url, timeout).await;
            }
        }));
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// All of primary, a slice of secondary and tertiary.
    fn sweep_targets(pool: &ProxyPool) -> Vec<Proxy> {
        let cache = pool.cache();
        let mut targets: Vec<Proxy> = cache
            .get_tier(CacheTier::Primary)
            .into_iter()
            .map(|e| e.proxy)
            .collect();
        targets.extend(
            cache
                .get_tier(CacheTier::Secondary)
                .into_iter()
                .take(SECONDARY_SAMPLE)
                .map(|e| e.proxy),
        );
        targets.extend(
            cache
                .get_tier(CacheTier::Tertiary)
                .into_iter()
                .take(TERTIARY_SAMPLE)
                .map(|e| e.proxy),
        );
        targets
    }

    async fn revalidate(
        pool: &ProxyPool,
        validator: &Validator,
        proxies: Vec<Proxy>,
        test_url: &str,
        timeout: Duration,
    ) {
        if proxies.is_empty() {
            return;
        }
        let outcomes = validator.validate_batch(&proxies, test_url, timeout).await;
        let mut survivors = 0;
        for (proxy, outcome) in outcomes {
            if outcome.valid {
                survivors += 1;
            }
            pool.apply_validation(&proxy, &outcome).await;
        }
        debug!(survivors, probed = proxies.len(), "preloader pass complete");
    }
}

impl Drop for Preloader {
    fn drop(&mut self) {
        self.stop();
    }
}
