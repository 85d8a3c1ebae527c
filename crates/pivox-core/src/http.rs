//! Shared HTTP client for talking to proxy list providers.
//!
//! Transient failures retry with exponential backoff; a process-wide
//! per-second quota keeps scraping polite regardless of how many sources
//! are enabled.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use tracing::debug;

use crate::error::{PivoxError, Result};

const USER_AGENT: &str = concat!("pivox/", env!("CARGO_PKG_VERSION"));

pub struct FetchClient {
    retrying: ClientWithMiddleware,
    plain: Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl FetchClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let plain = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PivoxError::Config(format!("failed to build http client: {e}")))?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(30))
            .build_with_max_retries(3);
        let retrying = ClientBuilder::new(plain.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let limiter = Arc::new(RateLimiter::direct(
            Quota::per_second(NonZeroU32::new(5).expect("5 is non-zero"))
                .allow_burst(NonZeroU32::new(10).expect("10 is non-zero")),
        ));

        Ok(Self {
            retrying,
            plain,
            limiter,
        })
    }

    /// GET a provider endpoint, requiring status 200.
    pub async fn get(&self, url: &str) -> Result<String> {
        self.limiter.until_ready().await;
        debug!(url, "fetching source");

        let response = self
            .retrying
            .get(url)
            .send()
            .await
            .map_err(|e| source_err(url, e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(source_err(url, format!("status {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| source_err(url, e.to_string()))
    }

    pub async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let body = self.get(url).await?;
        serde_json::from_str(&body).map_err(|e| source_err(url, format!("bad json: {e}")))
    }

    /// The caller's externally visible IP over a direct (unproxied)
    /// connection. Used by elite-anonymity validation.
    pub async fn egress_ip(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct IpResponse {
            ip: String,
        }
        let response: IpResponse = {
            let body = self
                .plain
                .get("https://api.ipify.org?format=json")
                .send()
                .await
                .map_err(|e| source_err("api.ipify.org", e.to_string()))?
                .text()
                .await
                .map_err(|e| source_err("api.ipify.org", e.to_string()))?;
            serde_json::from_str(&body)
                .map_err(|e| source_err("api.ipify.org", format!("bad json: {e}")))?
        };
        Ok(response.ip)
    }
}

fn source_err(url: &str, reason: String) -> PivoxError {
    let source_name = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string());
    PivoxError::SourceUnreachable { source_name, reason }
}
