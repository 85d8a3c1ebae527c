//! Engine configuration.
//!
//! Defaults cover every knob; an optional TOML file overrides them and the
//! `PIVOX_*` environment variables override both.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PivoxError, Result};
use crate::sources;

pub const ENV_SOURCES: &str = "PIVOX_SOURCES";
pub const ENV_CACHE_DIR: &str = "PIVOX_CACHE_DIR";
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "PIVOX_DEFAULT_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PivoxConfig {
    /// Source adapter names to enable.
    pub sources: Vec<String>,
    /// Directory backing the persistent key-value store.
    pub cache_dir: PathBuf,
    /// Default deadline for outbound requests and probes.
    pub default_timeout_ms: u64,
    /// URL fetched through a candidate proxy during validation.
    pub test_url: String,
    pub max_concurrent_validations: usize,
    /// Consecutive failures before a proxy is marked inactive.
    pub max_consecutive_failures: u32,
    /// Pool refresh staleness threshold.
    pub refresh_interval_secs: u64,
    /// Background revalidation cadence.
    pub validation_interval_secs: u64,
    pub allow_direct_fallback: bool,
    pub analytics_enabled: bool,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 500,
            per_day: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub primary_capacity: usize,
    pub secondary_capacity: usize,
    pub tertiary_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            primary_capacity: 10,
            secondary_capacity: 50,
            tertiary_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_per_domain: usize,
    pub min_level: usize,
    pub max_level: usize,
    pub resource_check_ms: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_per_domain: 2,
            min_level: 1,
            max_level: 32,
            resource_check_ms: 5000,
            cpu_threshold: 0.8,
            memory_threshold: 0.8,
        }
    }
}

impl Default for PivoxConfig {
    fn default() -> Self {
        Self {
            sources: sources::default_source_names()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cache_dir: PathBuf::from("pivox-cache"),
            default_timeout_ms: 10_000,
            test_url: "https://api.ipify.org?format=json".to_string(),
            max_concurrent_validations: 10,
            max_consecutive_failures: 3,
            refresh_interval_secs: 300,
            validation_interval_secs: 1800,
            allow_direct_fallback: false,
            analytics_enabled: false,
            rate_limits: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl PivoxConfig {
    /// Defaults, then environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// TOML file, then environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PivoxError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config: PivoxConfig = toml::from_str(&content)
            .map_err(|e| PivoxError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var(ENV_SOURCES) {
            self.sources = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            debug!(sources = ?self.sources, "source set overridden from environment");
        }
        if let Ok(val) = std::env::var(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var(ENV_DEFAULT_TIMEOUT_MS) {
            self.default_timeout_ms = val.parse().map_err(|_| {
                PivoxError::Config(format!("{ENV_DEFAULT_TIMEOUT_MS} must be an integer, got {val:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(PivoxError::Config("at least one source must be enabled".into()));
        }
        for name in &self.sources {
            if !sources::is_known_source(name) {
                return Err(PivoxError::Config(format!("unknown source {name:?}")));
            }
        }
        if self.default_timeout_ms == 0 {
            return Err(PivoxError::Config("default_timeout_ms must be positive".into()));
        }
        if self.max_concurrent_validations == 0 {
            return Err(PivoxError::Config(
                "max_concurrent_validations must be positive".into(),
            ));
        }
        let limits = &self.rate_limits;
        if limits.per_minute == 0 || limits.per_hour == 0 || limits.per_day == 0 {
            return Err(PivoxError::Config("rate limits must be positive".into()));
        }
        let sched = &self.scheduler;
        if sched.min_level == 0 || sched.min_level > sched.max_level {
            return Err(PivoxError::Config(
                "scheduler levels must satisfy 0 < min_level <= max_level".into(),
            ));
        }
        if !(0.0..=1.0).contains(&sched.cpu_threshold) || !(0.0..=1.0).contains(&sched.memory_threshold) {
            return Err(PivoxError::Config("resource thresholds must be in [0, 1]".into()));
        }
        if self.cache.primary_capacity == 0
            || self.cache.secondary_capacity == 0
            || self.cache.tertiary_capacity == 0
        {
            return Err(PivoxError::Config("cache tier capacities must be positive".into()));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PivoxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limits.per_minute, 30);
        assert_eq!(config.cache.primary_capacity, 10);
    }

    #[test]
    fn test_unknown_source_rejected() {
        let mut config = PivoxConfig::default();
        config.sources = vec!["not-a-real-source".into()];
        assert!(matches!(config.validate(), Err(PivoxError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = PivoxConfig::default();
        config.default_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PivoxConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: PivoxConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sources, config.sources);
        assert_eq!(parsed.default_timeout_ms, config.default_timeout_ms);
    }
}
