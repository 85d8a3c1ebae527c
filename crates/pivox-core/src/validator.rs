//! Proxy health probes.
//!
//! A probe decides whether a candidate is currently usable and measures
//! its latency. Probes never touch scores; the pool manager applies
//! outcomes. Concurrency is bounded by a semaphore so validation bursts
//! cannot crowd out user traffic.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::proxy::{AnonymityLevel, Proxy};

pub const DEFAULT_MAX_CONCURRENT_VALIDATIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<ErrorKind>,
}

impl ValidationOutcome {
    fn ok(latency_ms: u64) -> Self {
        Self {
            valid: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    fn failed(error: ErrorKind) -> Self {
        Self {
            valid: false,
            latency_ms: None,
            error: Some(error),
        }
    }
}

pub struct Validator {
    semaphore: Arc<Semaphore>,
    egress_ip: OnceCell<Option<String>>,
}

impl Validator {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_semaphore(Arc::new(Semaphore::new(max_concurrent.max(1))))
    }

    /// Share a caller-supplied semaphore, e.g. to give the preloader its
    /// own budget separate from foreground validation.
    pub fn with_semaphore(semaphore: Arc<Semaphore>) -> Self {
        Self {
            semaphore,
            egress_ip: OnceCell::new(),
        }
    }

    /// Probe one proxy. HTTP(S) proxies must complete a 200 GET of
    /// `test_url` within the deadline; SOCKS proxies validate by TCP
    /// handshake alone. Idempotent and independent per call.
    pub async fn validate(
        &self,
        proxy: &Proxy,
        test_url: &str,
        timeout: Duration,
    ) -> ValidationOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return ValidationOutcome::failed(ErrorKind::ValidationFailed),
        };

        let outcome = if proxy.protocol.is_socks() {
            self.probe_tcp(proxy, timeout).await
        } else {
            self.probe_http(proxy, test_url, timeout).await
        };

        match &outcome {
            o if o.valid => {
                debug!(proxy = %proxy, latency_ms = o.latency_ms, "proxy validated")
            }
            o => debug!(proxy = %proxy, error = ?o.error, "proxy failed validation"),
        }
        outcome
    }

    /// Probe a batch concurrently; the shared semaphore bounds parallelism.
    pub async fn validate_batch(
        &self,
        proxies: &[Proxy],
        test_url: &str,
        timeout: Duration,
    ) -> Vec<(Proxy, ValidationOutcome)> {
        let futures = proxies.iter().map(|proxy| async move {
            let outcome = self.validate(proxy, test_url, timeout).await;
            (proxy.clone(), outcome)
        });
        futures::future::join_all(futures).await
    }

    async fn probe_tcp(&self, proxy: &Proxy, timeout: Duration) -> ValidationOutcome {
        let start = std::time::Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((proxy.host.as_str(), proxy.port)))
            .await
        {
            Ok(Ok(_stream)) => ValidationOutcome::ok(start.elapsed().as_millis() as u64),
            Ok(Err(_)) => ValidationOutcome::failed(ErrorKind::ProxyConnect),
            Err(_) => ValidationOutcome::failed(ErrorKind::ProxyTimeout),
        }
    }

    async fn probe_http(
        &self,
        proxy: &Proxy,
        test_url: &str,
        timeout: Duration,
    ) -> ValidationOutcome {
        let client = match proxied_client(proxy, timeout) {
            Ok(client) => client,
            Err(_) => return ValidationOutcome::failed(ErrorKind::ValidationFailed),
        };

        let start = std::time::Instant::now();
        let response = match client.get(test_url).send().await {
            Ok(response) => response,
            Err(e) => return ValidationOutcome::failed(classify_reqwest(&e)),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let status = response.status();
        if status == reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return ValidationOutcome::failed(ErrorKind::ProxyAuth);
        }
        if status != reqwest::StatusCode::OK {
            return ValidationOutcome::failed(ErrorKind::ValidationFailed);
        }

        // Elite proxies must not leak the caller's own address anywhere in
        // the response body.
        if proxy.anonymity() == Some(AnonymityLevel::Elite) {
            let body = response.text().await.unwrap_or_default();
            if let Some(egress) = self.egress_ip().await {
                if body.contains(&egress) {
                    return ValidationOutcome::failed(ErrorKind::ValidationFailed);
                }
            }
        }

        ValidationOutcome::ok(latency_ms)
    }

    /// The caller's direct-connection address, fetched once and cached.
    /// When unavailable the leak check is skipped rather than failing
    /// every elite candidate.
    async fn egress_ip(&self) -> Option<String> {
        self.egress_ip
            .get_or_init(|| async {
                #[derive(serde::Deserialize)]
                struct IpResponse {
                    ip: String,
                }
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .ok()?;
                let body = client
                    .get("https://api.ipify.org?format=json")
                    .send()
                    .await
                    .ok()?
                    .text()
                    .await
                    .ok()?;
                match serde_json::from_str::<IpResponse>(&body) {
                    Ok(r) => Some(r.ip),
                    Err(e) => {
                        warn!(error = %e, "could not determine egress ip, skipping leak checks");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_VALIDATIONS)
    }
}

pub(crate) fn proxied_client(
    proxy: &Proxy,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut upstream = reqwest::Proxy::all(proxy.url())?;
    if let Some(auth) = &proxy.auth {
        upstream = upstream.basic_auth(&auth.username, &auth.password);
    }
    reqwest::Client::builder()
        .proxy(upstream)
        .timeout(timeout)
        .build()
}

pub(crate) fn classify_reqwest(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::ProxyTimeout
    } else if e.is_connect() {
        ErrorKind::ProxyConnect
    } else {
        ErrorKind::ValidationFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyProtocol;

    #[tokio::test]
    async fn test_socks_probe_unreachable() {
        let validator = Validator::new(2);
        // Reserved TEST-NET address, nothing listens there.
        let proxy = Proxy::new("192.0.2.1", 1080, ProxyProtocol::Socks5);
        let outcome = validator
            .validate(&proxy, "http://example.com", Duration::from_millis(300))
            .await;
        assert!(!outcome.valid);
        assert!(matches!(
            outcome.error,
            Some(ErrorKind::ProxyConnect) | Some(ErrorKind::ProxyTimeout)
        ));
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let validator = Validator::new(2);
        let proxy = Proxy::new("192.0.2.1", 8080, ProxyProtocol::Http);
        let outcome = validator
            .validate(&proxy, "http://example.com", Duration::from_millis(300))
            .await;
        assert!(!outcome.valid);
        assert!(outcome.latency_ms.is_none());
    }
}
