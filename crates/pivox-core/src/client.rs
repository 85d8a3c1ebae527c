//! The HTTP middleware: an ordinary request spliced through a rotated
//! proxy, with outcomes fed back into scoring.
//!
//! Proxy-layer failures (connect refused/reset, TLS with the proxy, 407,
//! 502/503/504 from the proxy, timeout before first byte) rotate to a
//! different proxy and retry. Destination statuses, including errors, are
//! returned to the caller and count as successes for the proxy that
//! carried them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub use reqwest::header::HeaderMap;
pub use reqwest::Method;
use tracing::{debug, warn};

use crate::analytics::Analytics;
use crate::error::{PivoxError, Result};
use crate::pool::{FetchOptions, ProxyPool};
use crate::proxy::Proxy;
use crate::rate_limit::RateLimiter;
use crate::rotation::RotationKind;
use crate::validator::{classify_reqwest, proxied_client};

/// HTTP statuses produced by the proxy layer rather than the destination.
const PROXY_LAYER_STATUSES: [u16; 4] = [407, 502, 503, 504];

/// How many selection attempts to spend avoiding proxies this request has
/// already burned.
const SELECTION_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub use_validated_proxies: bool,
    pub rotate: bool,
    pub max_retries: u32,
    pub strategy: Option<RotationKind>,
    pub use_https: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            use_validated_proxies: true,
            rotate: true,
            max_retries: 3,
            strategy: None,
            use_https: true,
        }
    }
}

#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// The proxy that carried the request, if any.
    pub proxy: Option<Proxy>,
    /// Time to response headers.
    pub elapsed_ms: u64,
}

impl ProxiedResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct PivoxClient {
    pool: Arc<ProxyPool>,
    rate_limiter: Arc<RateLimiter>,
    analytics: Option<Arc<Analytics>>,
    defaults: RequestOptions,
    timeout: Duration,
    allow_direct_fallback: bool,
}

impl PivoxClient {
    pub fn new(
        pool: Arc<ProxyPool>,
        rate_limiter: Arc<RateLimiter>,
        analytics: Option<Arc<Analytics>>,
        defaults: RequestOptions,
        timeout: Duration,
        allow_direct_fallback: bool,
    ) -> Self {
        Self {
            pool,
            rate_limiter,
            analytics,
            defaults,
            timeout,
            allow_direct_fallback,
        }
    }

    pub async fn get(&self, url: &str) -> Result<ProxiedResponse> {
        self.request(Method::GET, url, None, None, None).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<Vec<u8>>,
        options: Option<RequestOptions>,
    ) -> Result<ProxiedResponse> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let url = if options.use_https && url.starts_with("http://") {
            url.replacen("http://", "https://", 1)
        } else {
            url.to_string()
        };

        let parsed = url::Url::parse(&url)
            .map_err(|e| PivoxError::Config(format!("invalid url {url:?}: {e}")))?;
        let domain = parsed
            .host_str()
            .ok_or_else(|| PivoxError::Config(format!("url {url:?} has no host")))?
            .to_string();

        self.rate_limiter.wait_for_permission(&domain).await?;

        let mut burned: HashSet<String> = HashSet::new();
        let mut current: Option<Proxy> = None;
        let mut last_error: Option<PivoxError> = None;

        for attempt in 0..=options.max_retries {
            let proxy = match &current {
                Some(proxy) if !options.rotate => Some(proxy.clone()),
                _ => self.acquire(&options, &burned).await?,
            };
            current = proxy.clone();

            if attempt > 0 {
                debug!(url = %url, attempt, proxy = ?proxy.as_ref().map(|p| p.key()), "retrying request");
            }

            match self.send_once(&method, &url, &headers, &body, proxy.as_ref()).await {
                Ok(response) => match &proxy {
                    Some(proxy) if PROXY_LAYER_STATUSES.contains(&response.status) => {
                        // 407 / 502 / 503 / 504 out of the proxy layer.
                        self.pool.record_failure(proxy).await;
                        burned.insert(proxy.key());
                        let error = if response.status == 407 {
                            PivoxError::ProxyAuth
                        } else {
                            PivoxError::ProxyConnect(format!("proxy returned {}", response.status))
                        };
                        if !options.rotate && matches!(error, PivoxError::ProxyAuth) {
                            // Never re-present credentials to the same proxy.
                            return Err(error);
                        }
                        last_error = Some(error);
                    }
                    _ => {
                        match &proxy {
                            Some(proxy) => {
                                self.pool.record_success(proxy, response.elapsed_ms).await
                            }
                            None => {
                                if let Some(analytics) = &self.analytics {
                                    analytics.record_request(response.status < 400);
                                }
                            }
                        }
                        return Ok(response);
                    }
                },
                Err(error) => match &proxy {
                    Some(proxy) if error.is_proxy_fault() => {
                        self.pool.record_failure(proxy).await;
                        burned.insert(proxy.key());
                        last_error = Some(error);
                    }
                    _ => return Err(error),
                },
            }
        }

        Err(last_error.unwrap_or(PivoxError::NoProxiesAvailable))
    }

    /// Pick a proxy per the configured strategy, avoiding ones already
    /// burned this request. An empty pool triggers a fetch-and-validate;
    /// a still-empty pool falls through to a direct connection when that
    /// is allowed.
    async fn acquire(
        &self,
        options: &RequestOptions,
        burned: &HashSet<String>,
    ) -> Result<Option<Proxy>> {
        for _ in 0..SELECTION_ATTEMPTS {
            match self
                .pool
                .next(options.strategy, options.use_validated_proxies)
                .await
            {
                Ok(proxy) => {
                    if burned.contains(&proxy.key()) {
                        continue;
                    }
                    return Ok(Some(proxy));
                }
                Err(PivoxError::NoProxiesAvailable) => break,
                Err(e) => return Err(e),
            }
        }

        debug!("pool empty or exhausted, fetching fresh proxies");
        let fetched = self
            .pool
            .fetch_validated(&FetchOptions::default(), None)
            .await;
        if !fetched.is_empty() {
            if let Ok(proxy) = self
                .pool
                .next(options.strategy, options.use_validated_proxies)
                .await
            {
                return Ok(Some(proxy));
            }
        }

        if self.allow_direct_fallback {
            warn!("no usable proxies, falling back to direct connection");
            return Ok(None);
        }
        Err(PivoxError::NoProxiesAvailable)
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        headers: &Option<HeaderMap>,
        body: &Option<Vec<u8>>,
        proxy: Option<&Proxy>,
    ) -> Result<ProxiedResponse> {
        let client = match proxy {
            Some(proxy) => proxied_client(proxy, self.timeout)
                .map_err(|e| PivoxError::ProxyConnect(e.to_string()))?,
            None => reqwest::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| PivoxError::Config(format!("failed to build http client: {e}")))?,
        };

        let mut request = client.request(method.clone(), url);
        if let Some(headers) = headers {
            request = request.headers(headers.clone());
        }
        if let Some(body) = body {
            request = request.body(body.clone());
        }

        let start = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            let kind = classify_reqwest(&e);
            match kind {
                crate::error::ErrorKind::ProxyTimeout => PivoxError::ProxyTimeout,
                _ => PivoxError::ProxyConnect(e.to_string()),
            }
        })?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| PivoxError::ProxyConnect(format!("body read failed: {e}")))?
            .to_vec();

        Ok(ProxiedResponse {
            status,
            headers: response_headers,
            body,
            proxy: proxy.cloned(),
            elapsed_ms,
        })
    }
}
