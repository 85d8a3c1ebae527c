//! Proxy list providers and the registry that drives them.
//!
//! Each adapter turns one remote endpoint into a batch of candidate
//! proxies. A failing adapter is skipped, never fatal; the pool refreshes
//! from whatever subset of providers is reachable.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{PivoxError, Result};
use crate::http::FetchClient;
use crate::proxy::{is_valid_host, AnonymityLevel, Proxy, ProxyMetadata, ProxyProtocol};
use crate::scrape;

/// One remote provider of candidate proxies.
///
/// `parse` is total: bad rows are dropped, never raised. `fetch` fails only
/// when the endpoint itself is unreachable or returns a non-200 status.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &'static str;
    fn url(&self) -> String;
    fn parse(&self, body: &str) -> Vec<Proxy>;

    async fn fetch(&self, client: &FetchClient) -> Result<Vec<Proxy>> {
        let body = client.get(&self.url()).await.map_err(|e| match e {
            PivoxError::SourceUnreachable { reason, .. } => PivoxError::SourceUnreachable {
                source_name: self.name().to_string(),
                reason,
            },
            other => other,
        })?;

        // Duplicate (host, port) within a batch collapse to the first row.
        let mut seen = HashSet::new();
        let proxies = self
            .parse(&body)
            .into_iter()
            .filter(|p| seen.insert(p.key()))
            .collect();
        Ok(proxies)
    }
}

pub struct FreeProxyList;

#[async_trait]
impl ProxySource for FreeProxyList {
    fn name(&self) -> &'static str {
        "free-proxy-list"
    }
    fn url(&self) -> String {
        "https://free-proxy-list.net/".to_string()
    }
    fn parse(&self, body: &str) -> Vec<Proxy> {
        scrape::parse_proxy_table(body)
    }
}

pub struct SslProxies;

#[async_trait]
impl ProxySource for SslProxies {
    fn name(&self) -> &'static str {
        "sslproxies"
    }
    fn url(&self) -> String {
        "https://www.sslproxies.org/".to_string()
    }
    fn parse(&self, body: &str) -> Vec<Proxy> {
        scrape::parse_proxy_table(body)
    }
}

pub struct UsProxy;

#[async_trait]
impl ProxySource for UsProxy {
    fn name(&self) -> &'static str {
        "us-proxy"
    }
    fn url(&self) -> String {
        "https://www.us-proxy.org/".to_string()
    }
    fn parse(&self, body: &str) -> Vec<Proxy> {
        scrape::parse_proxy_table(body)
    }
}

pub struct ProxyNova;

#[async_trait]
impl ProxySource for ProxyNova {
    fn name(&self) -> &'static str {
        "proxynova"
    }
    fn url(&self) -> String {
        "https://www.proxynova.com/proxy-server-list/".to_string()
    }
    fn parse(&self, body: &str) -> Vec<Proxy> {
        scrape::parse_proxynova(body)
    }
}

/// JSON API provider.
pub struct GeoNode;

#[derive(Deserialize)]
struct GeoNodeResponse {
    data: Vec<GeoNodeProxy>,
}

#[derive(Deserialize)]
struct GeoNodeProxy {
    ip: String,
    port: String,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(rename = "anonymityLevel", default)]
    anonymity_level: Option<String>,
    #[serde(default)]
    isp: Option<String>,
}

#[async_trait]
impl ProxySource for GeoNode {
    fn name(&self) -> &'static str {
        "geonode"
    }
    fn url(&self) -> String {
        "https://proxylist.geonode.com/api/proxy-list?limit=200&page=1&sort_by=lastChecked&sort_type=desc"
            .to_string()
    }

    fn parse(&self, body: &str) -> Vec<Proxy> {
        let response: GeoNodeResponse = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "geonode returned unparseable body");
                return Vec::new();
            }
        };

        response
            .data
            .into_iter()
            .filter_map(|p| {
                let port = p.port.parse::<u16>().ok().filter(|&p| p > 0)?;
                if !is_valid_host(&p.ip) {
                    return None;
                }
                let protocol = if p.protocols.iter().any(|s| s == "socks5") {
                    ProxyProtocol::Socks5
                } else if p.protocols.iter().any(|s| s == "socks4") {
                    ProxyProtocol::Socks4
                } else if p.protocols.iter().any(|s| s == "https") {
                    ProxyProtocol::Https
                } else {
                    ProxyProtocol::Http
                };
                let anonymity = p.anonymity_level.as_deref().and_then(AnonymityLevel::parse);
                Some(Proxy::new(p.ip, port, protocol).with_metadata(ProxyMetadata {
                    country: p.country,
                    region: None,
                    isp: p.isp,
                    anonymity,
                }))
            })
            .collect()
    }
}

pub fn default_source_names() -> &'static [&'static str] {
    &["free-proxy-list", "sslproxies", "us-proxy", "proxynova", "geonode"]
}

pub fn is_known_source(name: &str) -> bool {
    default_source_names().contains(&name)
}

fn build_source(name: &str) -> Option<Box<dyn ProxySource>> {
    match name {
        "free-proxy-list" => Some(Box::new(FreeProxyList)),
        "sslproxies" => Some(Box::new(SslProxies)),
        "us-proxy" => Some(Box::new(UsProxy)),
        "proxynova" => Some(Box::new(ProxyNova)),
        "geonode" => Some(Box::new(GeoNode)),
        _ => None,
    }
}

/// The enabled adapters plus per-source fetch bookkeeping.
pub struct SourceSet {
    sources: Vec<Box<dyn ProxySource>>,
    last_fetched: HashMap<String, DateTime<Utc>>,
}

impl std::fmt::Debug for SourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSet")
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("last_fetched", &self.last_fetched)
            .finish()
    }
}

impl SourceSet {
    pub fn build(names: &[String]) -> Result<Self> {
        let mut sources = Vec::with_capacity(names.len());
        for name in names {
            let source = build_source(name)
                .ok_or_else(|| PivoxError::Config(format!("unknown source {name:?}")))?;
            sources.push(source);
        }
        Ok(Self {
            sources,
            last_fetched: HashMap::new(),
        })
    }

    /// Assemble from arbitrary adapters, e.g. custom providers.
    pub fn from_sources(sources: Vec<Box<dyn ProxySource>>) -> Self {
        Self {
            sources,
            last_fetched: HashMap::new(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn last_fetched_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.last_fetched.get(name).copied()
    }

    /// Fetch every enabled source, skipping failures, deduplicating across
    /// sources by identity (first occurrence wins). Returns per-source
    /// counts alongside the merged batch for attribution.
    pub async fn fetch_all(&mut self, client: &FetchClient) -> (Vec<Proxy>, HashMap<String, usize>) {
        let mut merged = Vec::new();
        let mut seen = HashSet::new();
        let mut counts = HashMap::new();

        for source in &self.sources {
            match source.fetch(client).await {
                Ok(batch) => {
                    info!(source = source.name(), count = batch.len(), "fetched proxies");
                    counts.insert(source.name().to_string(), batch.len());
                    self.last_fetched.insert(source.name().to_string(), Utc::now());
                    for proxy in batch {
                        if seen.insert(proxy.key()) {
                            merged.push(proxy);
                        }
                    }
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "source fetch failed, skipping");
                }
            }
        }

        info!(total = merged.len(), "merged unique proxies from sources");
        (merged, counts)
    }
}
