use std::hash::{Hash, Hasher};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Transport variant of a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks5" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyProtocol::Socks4 | ProxyProtocol::Socks5)
    }

    pub fn supports_https(&self) -> bool {
        matches!(self, ProxyProtocol::Https | ProxyProtocol::Socks5)
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much of the client a proxy reveals to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    Transparent,
    Anonymous,
    Elite,
}

impl AnonymityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityLevel::Transparent => "transparent",
            AnonymityLevel::Anonymous => "anonymous",
            AnonymityLevel::Elite => "elite",
        }
    }

    /// Lenient parsing for the vocabulary free lists actually use.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "transparent" | "low" => Some(AnonymityLevel::Transparent),
            "anonymous" | "medium" => Some(AnonymityLevel::Anonymous),
            "elite" | "elite proxy" | "high" | "high anonymity" => Some(AnonymityLevel::Elite),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyMetadata {
    pub country: Option<String>,
    pub region: Option<String>,
    pub isp: Option<String>,
    pub anonymity: Option<AnonymityLevel>,
}

/// An immutable proxy endpoint. Equality and hashing are identity-only
/// (`host`, `port`); protocol, credentials and metadata do not participate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub auth: Option<ProxyAuth>,
    #[serde(default)]
    pub metadata: ProxyMetadata,
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            auth: None,
            metadata: ProxyMetadata::default(),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_metadata(mut self, metadata: ProxyMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Identity key used wherever a back-reference would be.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Scheme URL without credentials, suitable for `reqwest::Proxy`.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }

    pub fn anonymity(&self) -> Option<AnonymityLevel> {
        self.metadata.anonymity
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// Syntactic host check: dotted-quad IPv4 or a plausible hostname.
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return true;
    }
    // Hostname: dot-separated labels of alphanumerics and hyphens, no label
    // starting or ending with a hyphen.
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Lifecycle state tracked by the pool manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Unknown,
    Validating,
    Active,
    Inactive,
}

/// Smoothing factor for the response-time moving average.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Latency at or above which the latency term of the composite bottoms out.
const LATENCY_CEILING_MS: f64 = 5000.0;

const W_SUCCESS_RATE: f64 = 0.35;
const W_LATENCY: f64 = 0.25;
const W_UPTIME: f64 = 0.15;
const W_STABILITY: f64 = 0.10;
const W_STREAK: f64 = 0.10;
const W_GEO: f64 = 0.05;

/// Mutable performance aggregate for one proxy. Mutated only through
/// `record_success` / `record_failure`, serialized by the pool manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyScore {
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub uptime: f64,
    pub stability: f64,
    pub age_hours: f64,
    pub geo_distance_score: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_used_epoch_ms: i64,
    created_at_epoch_ms: i64,
}

impl Default for ProxyScore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyScore {
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            success_rate: 0.0,
            avg_response_time_ms: 0.0,
            successful_requests: 0,
            failed_requests: 0,
            uptime: 0.0,
            stability: 0.0,
            age_hours: 0.0,
            geo_distance_score: 0.5,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_used_epoch_ms: now,
            created_at_epoch_ms: now,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.successful_requests + self.failed_requests
    }

    /// Apply one successful outcome. Latency folds into the EMA; the
    /// consecutive-failure streak resets.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.successful_requests += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;

        if self.avg_response_time_ms <= 0.0 {
            self.avg_response_time_ms = latency_ms as f64;
        } else {
            self.avg_response_time_ms = self.avg_response_time_ms * (1.0 - LATENCY_EMA_ALPHA)
                + latency_ms as f64 * LATENCY_EMA_ALPHA;
        }

        self.after_outcome();
        // Uptime tracks the long-run success ratio; stability rewards the
        // current streak saturating at 10.
        self.uptime = self.success_rate;
        self.stability = (self.stability * 0.9 + 0.1).min(1.0);
    }

    /// Apply one failed outcome. The latency EMA is left untouched; the
    /// consecutive-success streak resets.
    pub fn record_failure(&mut self) {
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        self.after_outcome();
        self.uptime = self.success_rate;
        self.stability *= 0.7;
    }

    fn after_outcome(&mut self) {
        let total = self.total_requests();
        self.success_rate = if total == 0 {
            0.0
        } else {
            self.successful_requests as f64 / total as f64
        };
        let now = Utc::now().timestamp_millis();
        self.last_used_epoch_ms = now;
        self.age_hours = (now - self.created_at_epoch_ms).max(0) as f64 / 3_600_000.0;
    }

    /// Weighted composite in `[0, 1]`. Monotone: more successes, lower
    /// latency, higher uptime, higher stability and longer success streaks
    /// all raise it.
    pub fn composite(&self) -> f64 {
        let latency_score = if self.avg_response_time_ms <= 0.0 {
            0.5
        } else {
            (1.0 - self.avg_response_time_ms / LATENCY_CEILING_MS).max(0.0)
        };
        let streak_score = (self.consecutive_successes as f64 / 10.0).min(1.0);

        let score = self.success_rate * W_SUCCESS_RATE
            + latency_score * W_LATENCY
            + self.uptime * W_UPTIME
            + self.stability * W_STABILITY
            + streak_score * W_STREAK
            + self.geo_distance_score * W_GEO;
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = Proxy::new("1.2.3.4", 8080, ProxyProtocol::Http);
        let b = Proxy::new("1.2.3.4", 8080, ProxyProtocol::Socks5).with_auth("u", "p");
        assert_eq!(a, b);
        assert_eq!(a.key(), "1.2.3.4:8080");
    }

    #[test]
    fn test_host_validation() {
        assert!(is_valid_host("192.168.0.1"));
        assert!(is_valid_host("proxy.example.com"));
        assert!(is_valid_host("localhost"));
        assert!(!is_valid_host(""));
        assert!(!is_valid_host("bad host"));
        assert!(!is_valid_host("-leading.example.com"));
    }

    #[test]
    fn test_score_streaks_exclusive() {
        let mut score = ProxyScore::new();
        score.record_success(100);
        score.record_success(100);
        assert_eq!(score.consecutive_successes, 2);
        assert_eq!(score.consecutive_failures, 0);

        score.record_failure();
        assert_eq!(score.consecutive_successes, 0);
        assert_eq!(score.consecutive_failures, 1);
        assert_eq!(score.total_requests(), 3);
    }

    #[test]
    fn test_latency_ema_only_on_success() {
        let mut score = ProxyScore::new();
        score.record_success(1000);
        assert!((score.avg_response_time_ms - 1000.0).abs() < f64::EPSILON);

        let before = score.avg_response_time_ms;
        score.record_failure();
        assert!((score.avg_response_time_ms - before).abs() < f64::EPSILON);

        score.record_success(500);
        assert!(score.avg_response_time_ms < before);
        assert!(score.avg_response_time_ms > 500.0);
    }

    #[test]
    fn test_composite_monotone_in_latency() {
        let mut fast = ProxyScore::new();
        let mut slow = ProxyScore::new();
        for _ in 0..5 {
            fast.record_success(50);
            slow.record_success(4000);
        }
        assert!(fast.composite() > slow.composite());
    }

    #[test]
    fn test_composite_bounded() {
        let mut score = ProxyScore::new();
        for _ in 0..100 {
            score.record_success(1);
        }
        assert!(score.composite() <= 1.0);
        assert!(score.composite() >= 0.0);
    }
}
