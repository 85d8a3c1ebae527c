pub mod analytics;
pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod monitor;
pub mod pool;
pub mod preloader;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod rotation;
pub mod scheduler;
pub mod scrape;
pub mod sources;
pub mod store;
pub mod validator;

pub use analytics::{Analytics, AnalyticsSnapshot};
pub use cache::{CacheEntry, CacheStats, CacheTier, TieredCache};
pub use client::{PivoxClient, ProxiedResponse, RequestOptions};
pub use config::{CacheConfig, PivoxConfig, RateLimitConfig, SchedulerConfig};
pub use engine::{Pivox, PivoxBuilder};
pub use error::{ErrorKind, PivoxError, Result};
pub use http::FetchClient;
pub use monitor::ResourceMonitor;
pub use pool::{FetchOptions, ProgressFn, ProxyPool};
pub use preloader::Preloader;
pub use proxy::{AnonymityLevel, Proxy, ProxyAuth, ProxyMetadata, ProxyProtocol, ProxyScore, ProxyState};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use rotation::{Candidate, RotationKind, RotationStrategy};
pub use scheduler::{TaskHandle, TaskPriority, TaskResult, TaskScheduler, TaskSpec, TaskStatus};
pub use sources::{ProxySource, SourceSet};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use validator::{ValidationOutcome, Validator};
