use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors crossing the public API or classified inside the engine.
///
/// Per-source and per-proxy failures are absorbed at the pool boundary;
/// only terminal conditions reach callers.
#[derive(Debug, Error)]
pub enum PivoxError {
    #[error("no proxies available")]
    NoProxiesAvailable,

    #[error("source {source_name} unreachable: {reason}")]
    SourceUnreachable { source_name: String, reason: String },

    #[error("proxy validation failed: {0}")]
    ValidationFailed(String),

    #[error("could not connect through proxy: {0}")]
    ProxyConnect(String),

    #[error("proxy rejected authentication")]
    ProxyAuth,

    #[error("proxy timed out before first byte")]
    ProxyTimeout,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("destination returned HTTP {status}")]
    DestinationHttp { status: u16 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, PivoxError>;

/// Discriminant-only view of the taxonomy, used by retry policies and
/// validation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoProxiesAvailable,
    SourceUnreachable,
    ValidationFailed,
    ProxyConnect,
    ProxyAuth,
    ProxyTimeout,
    RateLimited,
    DestinationHttp,
    Config,
    Store,
}

impl PivoxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PivoxError::NoProxiesAvailable => ErrorKind::NoProxiesAvailable,
            PivoxError::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            PivoxError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            PivoxError::ProxyConnect(_) => ErrorKind::ProxyConnect,
            PivoxError::ProxyAuth => ErrorKind::ProxyAuth,
            PivoxError::ProxyTimeout => ErrorKind::ProxyTimeout,
            PivoxError::RateLimited { .. } => ErrorKind::RateLimited,
            PivoxError::DestinationHttp { .. } => ErrorKind::DestinationHttp,
            PivoxError::Config(_) => ErrorKind::Config,
            PivoxError::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether the failure is attributable to the proxy itself rather than
    /// the destination. Proxy faults feed `record_failure` and justify
    /// rotating to a different proxy.
    pub fn is_proxy_fault(&self) -> bool {
        matches!(
            self,
            PivoxError::ProxyConnect(_)
                | PivoxError::ProxyAuth
                | PivoxError::ProxyTimeout
                | PivoxError::ValidationFailed(_)
        )
    }

    /// Whether a retry with a different proxy can reasonably succeed.
    /// `ProxyAuth` rotates but is never retried against the same proxy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PivoxError::ProxyConnect(_)
                | PivoxError::ProxyAuth
                | PivoxError::ProxyTimeout
                | PivoxError::RateLimited { .. }
        )
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoProxiesAvailable => "no_proxies_available",
            ErrorKind::SourceUnreachable => "source_unreachable",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::ProxyConnect => "proxy_connect",
            ErrorKind::ProxyAuth => "proxy_auth",
            ErrorKind::ProxyTimeout => "proxy_timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::DestinationHttp => "destination_http",
            ErrorKind::Config => "config",
            ErrorKind::Store => "store",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(PivoxError::NoProxiesAvailable.kind(), ErrorKind::NoProxiesAvailable);
        assert_eq!(PivoxError::ProxyAuth.kind(), ErrorKind::ProxyAuth);
        assert_eq!(
            PivoxError::DestinationHttp { status: 500 }.kind(),
            ErrorKind::DestinationHttp
        );
    }

    #[test]
    fn test_proxy_fault_classification() {
        assert!(PivoxError::ProxyConnect("refused".into()).is_proxy_fault());
        assert!(PivoxError::ProxyTimeout.is_proxy_fault());
        assert!(!PivoxError::DestinationHttp { status: 404 }.is_proxy_fault());
        assert!(!PivoxError::NoProxiesAvailable.is_proxy_fault());
    }

    #[test]
    fn test_retryability() {
        assert!(PivoxError::ProxyTimeout.is_retryable());
        assert!(!PivoxError::Config("bad".into()).is_retryable());
        assert!(!PivoxError::NoProxiesAvailable.is_retryable());
    }
}
