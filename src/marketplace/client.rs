//! HTTP client for the marketplace's paginated list endpoint.
//!
//! One call is one attempt: `GET {base}/{resource}?page_number=N&page_size=M`. Retry and
//! pacing decisions belong to the paginated fetcher; this layer only classifies the
//! response into the engine's error taxonomy.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::proxy::{ProxyEndpoint, ProxyFilters, ProxyProvider, ProxyStrategy};
use super::record::MarketplacePage;
use crate::config::MarketplaceConfig;
use crate::sync::SyncError;

const USER_AGENT: &str = concat!("marketplace-sync/", env!("CARGO_PKG_VERSION"));
const PROXIED_CLIENT_CACHE: usize = 32;
const ERROR_BODY_SNIPPET: usize = 200;

/// Proxy selection settings applied to every request.
#[derive(Clone)]
pub struct ProxySelection {
    pub provider: Arc<dyn ProxyProvider>,
    pub strategy: ProxyStrategy,
    pub filters: ProxyFilters,
}

pub struct MarketplaceClient {
    direct: Client,
    endpoint: Url,
    api_key: Option<String>,
    api_key_header: String,
    items_field: String,
    timeout: Duration,
    proxy: Option<ProxySelection>,
    proxied_clients: Mutex<LruCache<String, Client>>,
}

impl MarketplaceClient {
    pub fn new(config: &MarketplaceConfig) -> Result<Self, SyncError> {
        let endpoint = resource_url(&config.api_base, &config.resource)?;
        let timeout = config.request_timeout();
        let direct = build_client(timeout, None)?;

        Ok(Self {
            direct,
            endpoint,
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
            items_field: config.items_field.clone(),
            timeout,
            proxy: None,
            proxied_clients: Mutex::new(LruCache::new(
                NonZeroUsize::new(PROXIED_CLIENT_CACHE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    /// Route requests through proxies picked by `selection`.
    pub fn with_proxy(mut self, selection: ProxySelection) -> Self {
        self.proxy = Some(selection);
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fetch one page. Single attempt, no retries.
    pub async fn fetch_page(
        &self,
        page_number: u32,
        page_size: u32,
    ) -> Result<MarketplacePage, SyncError> {
        let proxy = self.pick_proxy().await;
        let client = match &proxy {
            Some(endpoint) => self.proxied_client(endpoint)?,
            None => self.direct.clone(),
        };

        let mut request = client
            .get(self.endpoint.clone())
            .query(&[("page_number", page_number), ("page_size", page_size)])
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header(self.api_key_header.as_str(), key.as_str());
        }

        let started = Instant::now();
        let result = request.send().await;
        let latency = started.elapsed();

        if let (Some(endpoint), Some(selection)) = (&proxy, &self.proxy) {
            let healthy = match &result {
                Ok(response) => !response.status().is_server_error(),
                Err(_) => false,
            };
            selection
                .provider
                .report_outcome(&endpoint.id, healthy, latency)
                .await;
        }

        let response = result.map_err(|e| self.network_error(e))?;
        self.classify(response, page_number).await
    }

    async fn classify(
        &self,
        response: Response,
        page_number: u32,
    ) -> Result<MarketplacePage, SyncError> {
        let status = response.status();

        if status.is_success() {
            let body: Value = response.json().await.map_err(|e| {
                if e.is_decode() {
                    SyncError::data_shape(format!("page {page_number} body is not JSON: {e}"))
                } else {
                    self.network_error(e)
                }
            })?;
            return MarketplacePage::parse(body, &self.items_field);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            debug!(page_number, ?retry_after_secs, "marketplace rate limited request");
            return Err(SyncError::RateLimited {
                retry_after_secs,
                attempts: 1,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(ERROR_BODY_SNIPPET).collect();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "marketplace rejected API key");
            return Err(SyncError::auth(
                status.as_u16(),
                format!("marketplace returned {status}: {snippet}"),
            ));
        }

        warn!(status = status.as_u16(), page_number, "marketplace request failed");
        Err(SyncError::transient(
            Some(status.as_u16()),
            format!("marketplace returned {status}: {snippet}"),
        ))
    }

    fn network_error(&self, error: reqwest::Error) -> SyncError {
        if error.is_timeout() {
            SyncError::transient(
                None,
                format!("request timed out after {}s", self.timeout.as_secs()),
            )
        } else {
            SyncError::transient(error.status().map(|s| s.as_u16()), error.to_string())
        }
    }

    async fn pick_proxy(&self) -> Option<ProxyEndpoint> {
        let selection = self.proxy.as_ref()?;
        selection
            .provider
            .next_proxy(selection.strategy, &selection.filters)
            .await
    }

    fn proxied_client(&self, endpoint: &ProxyEndpoint) -> Result<Client, SyncError> {
        let mut cache = self
            .proxied_clients
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        if let Some(client) = cache.get(&endpoint.url) {
            return Ok(client.clone());
        }

        let client = build_client(self.timeout, Some(&endpoint.url))?;
        cache.put(endpoint.url.clone(), client.clone());
        Ok(client)
    }
}

fn build_client(timeout: Duration, proxy_url: Option<&str>) -> Result<Client, SyncError> {
    let mut builder = Client::builder().timeout(timeout).user_agent(USER_AGENT);
    if let Some(url) = proxy_url {
        let proxy = reqwest::Proxy::all(url)
            .map_err(|e| SyncError::InvalidRequest(format!("invalid proxy url {url}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| SyncError::InvalidRequest(format!("failed to build HTTP client: {e}")))
}

/// `{base}/{resource}` without `Url::join` dropping the base's last path segment.
fn resource_url(base: &str, resource: &str) -> Result<Url, SyncError> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        resource.trim_start_matches('/')
    );
    Url::parse(&joined)
        .map_err(|e| SyncError::InvalidRequest(format!("invalid marketplace url {joined}: {e}")))
}
