//! Egress proxy selection.
//!
//! The rotation provider is an external collaborator; the engine only sees the
//! [`ProxyProvider`] trait. [`StaticProxyPool`] is the configured implementation used
//! when `MSYNC_PROXY_URLS` is set.

use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use url::Url;

use crate::config::ProxyConfig;

/// Weight of the newest latency sample in the moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyStrategy {
    #[default]
    RoundRobin,
    Random,
    LowestLatency,
}

impl FromStr for ProxyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "lowest_latency" => Ok(Self::LowestLatency),
            other => Err(format!("unknown proxy strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyFilters {
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub id: String,
    pub url: String,
    pub region: Option<String>,
}

/// Per-request egress selector.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// `None` means "go direct".
    async fn next_proxy(
        &self,
        strategy: ProxyStrategy,
        filters: &ProxyFilters,
    ) -> Option<ProxyEndpoint>;

    async fn report_outcome(&self, proxy_id: &str, success: bool, latency: Duration);
}

#[derive(Debug)]
struct ProxyState {
    endpoint: ProxyEndpoint,
    avg_latency_ms: Option<f64>,
    successes: u64,
    failures: u64,
}

/// Fixed pool of proxies with in-process health bookkeeping.
#[derive(Debug)]
pub struct StaticProxyPool {
    proxies: Mutex<Vec<ProxyState>>,
    next: AtomicUsize,
}

impl StaticProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        let proxies = endpoints
            .into_iter()
            .map(|endpoint| ProxyState {
                endpoint,
                avg_latency_ms: None,
                successes: 0,
                failures: 0,
            })
            .collect();
        Self {
            proxies: Mutex::new(proxies),
            next: AtomicUsize::new(0),
        }
    }

    /// Build the pool from configuration; entries are `scheme://host:port[#region]`.
    /// Returns `None` when no proxies are configured.
    pub fn from_config(config: &ProxyConfig) -> Result<Option<Self>, url::ParseError> {
        if config.urls.is_empty() {
            return Ok(None);
        }

        let mut endpoints = Vec::with_capacity(config.urls.len());
        for (index, raw) in config.urls.iter().enumerate() {
            let mut url = Url::parse(raw)?;
            let region = url.fragment().map(str::to_string).filter(|r| !r.is_empty());
            url.set_fragment(None);
            endpoints.push(ProxyEndpoint {
                id: format!("proxy-{index}"),
                url: url.to_string(),
                region,
            });
        }

        Ok(Some(Self::new(endpoints)))
    }

    /// `(successes, failures)` recorded for a proxy.
    pub fn stats(&self, proxy_id: &str) -> Option<(u64, u64)> {
        let proxies = self.proxies.lock().unwrap_or_else(|p| p.into_inner());
        proxies
            .iter()
            .find(|p| p.endpoint.id == proxy_id)
            .map(|p| (p.successes, p.failures))
    }
}

#[async_trait]
impl ProxyProvider for StaticProxyPool {
    async fn next_proxy(
        &self,
        strategy: ProxyStrategy,
        filters: &ProxyFilters,
    ) -> Option<ProxyEndpoint> {
        let proxies = self.proxies.lock().unwrap_or_else(|p| p.into_inner());
        let eligible: Vec<&ProxyState> = proxies
            .iter()
            .filter(|p| match &filters.region {
                Some(region) => p.endpoint.region.as_deref() == Some(region.as_str()),
                None => true,
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let chosen = match strategy {
            ProxyStrategy::RoundRobin => {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible[index]
            }
            ProxyStrategy::Random => eligible[rand::thread_rng().gen_range(0..eligible.len())],
            // Unmeasured proxies sort first so every proxy gets sampled
            ProxyStrategy::LowestLatency => eligible
                .iter()
                .copied()
                .min_by(|a, b| {
                    let a = a.avg_latency_ms.unwrap_or(0.0);
                    let b = b.avg_latency_ms.unwrap_or(0.0);
                    a.total_cmp(&b)
                })?,
        };

        Some(chosen.endpoint.clone())
    }

    async fn report_outcome(&self, proxy_id: &str, success: bool, latency: Duration) {
        let mut proxies = self.proxies.lock().unwrap_or_else(|p| p.into_inner());
        let Some(state) = proxies.iter_mut().find(|p| p.endpoint.id == proxy_id) else {
            return;
        };

        if success {
            state.successes += 1;
            let sample = latency.as_secs_f64() * 1000.0;
            state.avg_latency_ms = Some(match state.avg_latency_ms {
                Some(avg) => avg + LATENCY_EWMA_ALPHA * (sample - avg),
                None => sample,
            });
        } else {
            state.failures += 1;
        }
    }
}
