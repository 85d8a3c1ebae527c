//! Engine wiring: every component is an explicit constructor dependency
//! held by an application context, with no process-global state.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::analytics::Analytics;
use crate::cache::TieredCache;
use crate::client::{PivoxClient, RequestOptions};
use crate::config::PivoxConfig;
use crate::error::Result;
use crate::monitor::ResourceMonitor;
use crate::pool::ProxyPool;
use crate::preloader::Preloader;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::rotation::RotationKind;
use crate::scheduler::TaskScheduler;
use crate::store::{JsonFileStore, KeyValueStore};

/// The assembled engine. Components needing background work start in
/// `start_background` and wind down in `shutdown`.
pub struct Pivox {
    pub config: PivoxConfig,
    pub pool: Arc<ProxyPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub monitor: Arc<ResourceMonitor>,
    pub scheduler: Arc<TaskScheduler>,
    pub client: PivoxClient,
    pub analytics: Option<Arc<Analytics>>,
    preloader: Preloader,
}

impl std::fmt::Debug for Pivox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pivox")
            .field("config", &self.config)
            .field("analytics", &self.analytics.is_some())
            .finish_non_exhaustive()
    }
}

impl Pivox {
    pub fn builder() -> PivoxBuilder {
        PivoxBuilder::default()
    }

    pub fn start_background(&self) {
        self.monitor.start();
        self.scheduler.start();
        self.preloader.start();
        info!("background services started");
    }

    pub async fn shutdown(&self) {
        self.preloader.stop();
        self.scheduler.stop();
        self.monitor.stop();
        if let Some(analytics) = &self.analytics {
            let _ = analytics.persist().await;
        }
        info!("engine shut down");
    }
}

pub struct PivoxBuilder {
    config: Option<PivoxConfig>,
    store: Option<Arc<dyn KeyValueStore>>,
    strategy: RotationKind,
    request_defaults: RequestOptions,
    retry_policy: RetryPolicy,
}

impl Default for PivoxBuilder {
    fn default() -> Self {
        Self {
            config: None,
            store: None,
            strategy: RotationKind::RoundRobin,
            request_defaults: RequestOptions::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl PivoxBuilder {
    pub fn with_config(mut self, config: PivoxConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_strategy(mut self, strategy: RotationKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_request_defaults(mut self, defaults: RequestOptions) -> Self {
        self.request_defaults = defaults;
        self
    }

    pub fn use_validated_proxies(mut self, enabled: bool) -> Self {
        self.request_defaults.use_validated_proxies = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub async fn build(self) -> Result<Pivox> {
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => PivoxConfig::from_env()?,
        };

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonFileStore::new(&config.cache_dir)?),
        };

        let cache = Arc::new(TieredCache::new(config.cache, Arc::clone(&store)));
        let reloaded = cache.load().await?;
        if reloaded > 0 {
            info!(reloaded, "cache tiers restored from store");
        }

        let analytics = if config.analytics_enabled {
            let analytics = Arc::new(Analytics::new(Arc::clone(&store)));
            analytics.load().await;
            Some(analytics)
        } else {
            None
        };

        let pool = Arc::new(ProxyPool::new(&config, Arc::clone(&cache), analytics.clone())?);
        pool.set_strategy(self.strategy);

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits));
        let monitor = Arc::new(ResourceMonitor::new(Duration::from_millis(
            config.scheduler.resource_check_ms,
        )));
        let scheduler = TaskScheduler::new(
            config.scheduler,
            Arc::clone(&monitor),
            Arc::clone(&rate_limiter),
            self.retry_policy,
        );

        let client = PivoxClient::new(
            Arc::clone(&pool),
            Arc::clone(&rate_limiter),
            analytics.clone(),
            self.request_defaults,
            config.default_timeout(),
            config.allow_direct_fallback,
        );

        let preloader = Preloader::new(
            Arc::clone(&pool),
            config.max_concurrent_validations,
            Duration::from_secs(config.validation_interval_secs),
            config.test_url.clone(),
            config.default_timeout(),
        );

        Ok(Pivox {
            config,
            pool,
            rate_limiter,
            monitor,
            scheduler,
            client,
            analytics,
            preloader,
        })
    }
}
