//! Configuration loading for the marketplace sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `MSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;

const ENV_PREFIX: &str = "MSYNC_";

/// Application configuration derived from `MSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub fetch: FetchPolicyConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Connection settings for the external marketplace API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MarketplaceConfig {
    /// Base URL; the resource path is appended to it.
    ///
    /// Environment variable: `MSYNC_MARKETPLACE_API_BASE`
    #[serde(default = "default_marketplace_api_base")]
    pub api_base: String,

    /// Environment variable: `MSYNC_MARKETPLACE_API_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Header carrying the API key (default: `X-API-Key`)
    #[serde(default = "default_marketplace_api_key_header")]
    pub api_key_header: String,

    /// Paginated resource path, e.g. `products`
    #[serde(default = "default_marketplace_resource")]
    pub resource: String,

    /// Name of the list field in a page envelope
    #[serde(default = "default_marketplace_items_field")]
    pub items_field: String,

    /// Per-request HTTP timeout in seconds (default: 60)
    #[serde(default = "default_marketplace_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Retry and pacing policy for paginated fetches.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FetchPolicyConfig {
    /// Attempts per page after the first one (default: 3)
    ///
    /// Environment variable: `MSYNC_FETCH_MAX_RETRIES`
    #[serde(default = "default_fetch_max_retries")]
    #[schema(example = 3)]
    pub max_retries: u32,

    /// Delay applied after HTTP 429, multiplied by the attempt number (default: 2000)
    ///
    /// A `Retry-After` header larger than this delay wins.
    #[serde(default = "default_fetch_rate_limit_delay_ms")]
    #[schema(example = 2000)]
    pub rate_limit_delay_ms: u64,

    /// Starting backoff for transient failures: base_ms * 2^attempt
    #[serde(default = "default_fetch_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for transient backoff. Must be >= backoff_base_ms.
    #[serde(default = "default_fetch_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Random extra delay of up to `jitter_factor * backoff`
    #[serde(default = "default_fetch_jitter_factor")]
    #[schema(example = 0.1, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,

    /// Fixed pause between successful page fetches (default: 150)
    #[serde(default = "default_fetch_page_delay_ms")]
    #[schema(example = 150)]
    pub page_delay_ms: u64,
}

/// Job sizing, time budgets and merge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    #[serde(default = "default_sync_default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_sync_max_page_size")]
    pub max_page_size: u32,
    #[serde(default = "default_sync_default_batch_size")]
    pub default_batch_size: u32,
    #[serde(default = "default_sync_max_batch_size")]
    pub max_batch_size: u32,

    /// Maximum number of operations committed in one store batch call (default: 500)
    #[serde(default = "default_sync_write_batch_limit")]
    pub write_batch_limit: usize,

    /// Invocation budget for manual triggers (default: 540)
    #[serde(default = "default_sync_manual_timeout_secs")]
    pub manual_timeout_secs: u64,

    /// Invocation budget for scheduled triggers (default: 240)
    #[serde(default = "default_sync_scheduled_timeout_secs")]
    pub scheduled_timeout_secs: u64,

    /// Extra time an execution lease outlives the invocation budget (default: 60)
    #[serde(default = "default_sync_lease_grace_secs")]
    pub lease_grace_secs: u64,

    #[serde(default = "default_sync_numeric_tolerance")]
    pub numeric_tolerance: f64,

    /// Storage collection stamped on every entity read and write.
    ///
    /// Environment variable: `MSYNC_SYNC_STORE_COLLECTION`
    #[serde(default = "default_sync_store_collection")]
    pub store_collection: String,

    /// Allow-list of fields overwritten on every sync
    #[serde(default = "default_sync_refreshable_fields")]
    pub refreshable_fields: Vec<String>,

    /// Deny-list of fields owned by the analytics process
    #[serde(default = "default_sync_derived_fields")]
    pub derived_fields: Vec<String>,

    /// Used only for the completion estimate returned by initialize
    #[serde(default = "default_sync_estimated_page_seconds")]
    pub estimated_page_seconds: u64,
}

/// Optional egress proxy pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProxyConfig {
    /// Proxy URLs; a `#region` fragment tags the proxy with a region.
    ///
    /// Environment variable: `MSYNC_PROXY_URLS` (comma-separated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// `round_robin`, `random` or `lowest_latency`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Only proxies tagged with this region are selected when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            marketplace: MarketplaceConfig::default(),
            fetch: FetchPolicyConfig::default(),
            sync: SyncConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            api_base: default_marketplace_api_base(),
            api_key: None,
            api_key_header: default_marketplace_api_key_header(),
            resource: default_marketplace_resource(),
            items_field: default_marketplace_items_field(),
            request_timeout_secs: default_marketplace_request_timeout_secs(),
        }
    }
}

impl Default for FetchPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_fetch_max_retries(),
            rate_limit_delay_ms: default_fetch_rate_limit_delay_ms(),
            backoff_base_ms: default_fetch_backoff_base_ms(),
            backoff_max_ms: default_fetch_backoff_max_ms(),
            jitter_factor: default_fetch_jitter_factor(),
            page_delay_ms: default_fetch_page_delay_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_sync_default_page_size(),
            max_page_size: default_sync_max_page_size(),
            default_batch_size: default_sync_default_batch_size(),
            max_batch_size: default_sync_max_batch_size(),
            write_batch_limit: default_sync_write_batch_limit(),
            manual_timeout_secs: default_sync_manual_timeout_secs(),
            scheduled_timeout_secs: default_sync_scheduled_timeout_secs(),
            lease_grace_secs: default_sync_lease_grace_secs(),
            numeric_tolerance: default_sync_numeric_tolerance(),
            store_collection: default_sync_store_collection(),
            refreshable_fields: default_sync_refreshable_fields(),
            derived_fields: default_sync_derived_fields(),
            estimated_page_seconds: default_sync_estimated_page_seconds(),
        }
    }
}

impl MarketplaceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl FetchPolicyConfig {
    /// Validate fetch policy bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.backoff_base_ms,
                max: self.backoff_max_ms,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl SyncConfig {
    /// Validate job sizing and field policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(ConfigError::InvalidPageSize {
                value: self.default_page_size,
                max: self.max_page_size,
            });
        }

        if self.default_batch_size == 0 || self.default_batch_size > self.max_batch_size {
            return Err(ConfigError::InvalidBatchSize {
                value: self.default_batch_size,
                max: self.max_batch_size,
            });
        }

        if self.write_batch_limit == 0 {
            return Err(ConfigError::InvalidWriteBatchLimit);
        }

        if self.scheduled_timeout_secs == 0 || self.scheduled_timeout_secs > self.manual_timeout_secs
        {
            return Err(ConfigError::InvalidTimeouts {
                scheduled: self.scheduled_timeout_secs,
                manual: self.manual_timeout_secs,
            });
        }

        if self.numeric_tolerance < 0.0 {
            return Err(ConfigError::InvalidNumericTolerance {
                value: self.numeric_tolerance,
            });
        }

        if self.store_collection.trim().is_empty() {
            return Err(ConfigError::MissingStoreCollection);
        }

        if self.refreshable_fields.is_empty() {
            return Err(ConfigError::EmptyRefreshableFields);
        }

        if let Some(field) = self
            .refreshable_fields
            .iter()
            .find(|field| self.derived_fields.contains(field))
        {
            return Err(ConfigError::OverlappingFieldPolicy {
                field: field.clone(),
            });
        }

        Ok(())
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.urls {
            Url::parse(entry).map_err(|e| ConfigError::InvalidProxyUrl {
                value: entry.clone(),
                error: e.to_string(),
            })?;
        }

        if let Some(strategy) = &self.strategy {
            if !matches!(
                strategy.as_str(),
                "round_robin" | "random" | "lowest_latency"
            ) {
                return Err(ConfigError::InvalidProxyStrategy {
                    value: strategy.clone(),
                });
            }
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();

        if config.marketplace.api_key.is_some() {
            config.marketplace.api_key = Some("[REDACTED]".to_string());
        }

        // Proxy URLs may embed credentials
        if !config.proxy.urls.is_empty() {
            config.proxy.urls = vec!["[REDACTED]".to_string(); config.proxy.urls.len()];
        }

        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.profile.as_str(), "local" | "test")
            && self
                .marketplace
                .api_key
                .as_deref()
                .map_or(true, |key| key.trim().is_empty())
        {
            return Err(ConfigError::MissingApiKey);
        }

        Url::parse(&self.marketplace.api_base).map_err(|e| ConfigError::InvalidApiBase {
            value: self.marketplace.api_base.clone(),
            error: e.to_string(),
        })?;

        if self.marketplace.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidRequestTimeout);
        }

        self.fetch.validate()?;
        self.sync.validate()?;
        self.proxy.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/marketplace_sync".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_marketplace_api_base() -> String {
    "http://localhost:9000/api/v1".to_string()
}

fn default_marketplace_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_marketplace_resource() -> String {
    "products".to_string()
}

fn default_marketplace_items_field() -> String {
    "items".to_string()
}

fn default_marketplace_request_timeout_secs() -> u64 {
    60
}

fn default_fetch_max_retries() -> u32 {
    3
}

fn default_fetch_rate_limit_delay_ms() -> u64 {
    2000
}

fn default_fetch_backoff_base_ms() -> u64 {
    500
}

fn default_fetch_backoff_max_ms() -> u64 {
    30_000
}

fn default_fetch_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_fetch_page_delay_ms() -> u64 {
    150
}

fn default_sync_default_page_size() -> u32 {
    100
}

fn default_sync_max_page_size() -> u32 {
    500
}

fn default_sync_default_batch_size() -> u32 {
    10
}

fn default_sync_max_batch_size() -> u32 {
    100
}

fn default_sync_write_batch_limit() -> usize {
    500
}

fn default_sync_manual_timeout_secs() -> u64 {
    540 // 9 minutes
}

fn default_sync_scheduled_timeout_secs() -> u64 {
    240 // 4 minutes
}

fn default_sync_lease_grace_secs() -> u64 {
    60
}

fn default_sync_numeric_tolerance() -> f64 {
    0.01
}

fn default_sync_store_collection() -> String {
    "marketplace_products".to_string()
}

fn default_sync_refreshable_fields() -> Vec<String> {
    [
        "title",
        "price",
        "original_price",
        "currency",
        "stock",
        "status",
        "images",
        "category",
        "brand",
        "rating",
        "review_count",
        "url",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sync_derived_fields() -> Vec<String> {
    [
        "profit_margin",
        "sales_velocity",
        "opportunity_score",
        "price_history",
        "calculated_at",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sync_estimated_page_seconds() -> u64 {
    3
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("marketplace API key is missing; set MSYNC_MARKETPLACE_API_KEY")]
    MissingApiKey,
    #[error("invalid marketplace API base '{value}': {error}")]
    InvalidApiBase { value: String, error: String },
    #[error("marketplace request timeout must be positive")]
    InvalidRequestTimeout,
    #[error("fetch backoff base ({base}ms) cannot be greater than max ({max}ms)")]
    InvalidBackoffBounds { base: u64, max: u64 },
    #[error("fetch jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidJitter { value: f64 },
    #[error("default page size must be between 1 and {max}, got {value}")]
    InvalidPageSize { value: u32, max: u32 },
    #[error("default batch size must be between 1 and {max}, got {value}")]
    InvalidBatchSize { value: u32, max: u32 },
    #[error("write batch limit must be positive")]
    InvalidWriteBatchLimit,
    #[error(
        "scheduled timeout ({scheduled}s) must be positive and not exceed manual timeout ({manual}s)"
    )]
    InvalidTimeouts { scheduled: u64, manual: u64 },
    #[error("numeric tolerance cannot be negative, got {value}")]
    InvalidNumericTolerance { value: f64 },
    #[error("store collection is missing; set MSYNC_SYNC_STORE_COLLECTION")]
    MissingStoreCollection,
    #[error("refreshable field list cannot be empty")]
    EmptyRefreshableFields,
    #[error("field '{field}' is both refreshable and derived")]
    OverlappingFieldPolicy { field: String },
    #[error("invalid proxy url '{value}': {error}")]
    InvalidProxyUrl { value: String, error: String },
    #[error("unknown proxy strategy '{value}'")]
    InvalidProxyStrategy { value: String },
}

/// Loads configuration using layered `.env` files and `MSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration; the process environment wins over files.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);

        let marketplace = MarketplaceConfig {
            api_base: take_string(&mut layered, "MARKETPLACE_API_BASE")
                .unwrap_or_else(default_marketplace_api_base),
            api_key: take_string(&mut layered, "MARKETPLACE_API_KEY")
                .map(|key| key.trim().to_string()),
            api_key_header: take_string(&mut layered, "MARKETPLACE_API_KEY_HEADER")
                .unwrap_or_else(default_marketplace_api_key_header),
            resource: take_string(&mut layered, "MARKETPLACE_RESOURCE")
                .unwrap_or_else(default_marketplace_resource),
            items_field: take_string(&mut layered, "MARKETPLACE_ITEMS_FIELD")
                .unwrap_or_else(default_marketplace_items_field),
            request_timeout_secs: take_parsed(&mut layered, "MARKETPLACE_REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(default_marketplace_request_timeout_secs),
        };

        let fetch = FetchPolicyConfig {
            max_retries: take_parsed(&mut layered, "FETCH_MAX_RETRIES")
                .unwrap_or_else(default_fetch_max_retries),
            rate_limit_delay_ms: take_parsed(&mut layered, "FETCH_RATE_LIMIT_DELAY_MS")
                .unwrap_or_else(default_fetch_rate_limit_delay_ms),
            backoff_base_ms: take_parsed(&mut layered, "FETCH_BACKOFF_BASE_MS")
                .unwrap_or_else(default_fetch_backoff_base_ms),
            backoff_max_ms: take_parsed(&mut layered, "FETCH_BACKOFF_MAX_MS")
                .unwrap_or_else(default_fetch_backoff_max_ms),
            jitter_factor: take_parsed(&mut layered, "FETCH_JITTER_FACTOR")
                .unwrap_or_else(default_fetch_jitter_factor),
            page_delay_ms: take_parsed(&mut layered, "FETCH_PAGE_DELAY_MS")
                .unwrap_or_else(default_fetch_page_delay_ms),
        };

        let sync = SyncConfig {
            default_page_size: take_parsed(&mut layered, "SYNC_DEFAULT_PAGE_SIZE")
                .unwrap_or_else(default_sync_default_page_size),
            max_page_size: take_parsed(&mut layered, "SYNC_MAX_PAGE_SIZE")
                .unwrap_or_else(default_sync_max_page_size),
            default_batch_size: take_parsed(&mut layered, "SYNC_DEFAULT_BATCH_SIZE")
                .unwrap_or_else(default_sync_default_batch_size),
            max_batch_size: take_parsed(&mut layered, "SYNC_MAX_BATCH_SIZE")
                .unwrap_or_else(default_sync_max_batch_size),
            write_batch_limit: take_parsed(&mut layered, "SYNC_WRITE_BATCH_LIMIT")
                .unwrap_or_else(default_sync_write_batch_limit),
            manual_timeout_secs: take_parsed(&mut layered, "SYNC_MANUAL_TIMEOUT_SECS")
                .unwrap_or_else(default_sync_manual_timeout_secs),
            scheduled_timeout_secs: take_parsed(&mut layered, "SYNC_SCHEDULED_TIMEOUT_SECS")
                .unwrap_or_else(default_sync_scheduled_timeout_secs),
            lease_grace_secs: take_parsed(&mut layered, "SYNC_LEASE_GRACE_SECS")
                .unwrap_or_else(default_sync_lease_grace_secs),
            numeric_tolerance: take_parsed(&mut layered, "SYNC_NUMERIC_TOLERANCE")
                .unwrap_or_else(default_sync_numeric_tolerance),
            store_collection: take_string(&mut layered, "SYNC_STORE_COLLECTION")
                .unwrap_or_else(default_sync_store_collection),
            refreshable_fields: take_list(&mut layered, "SYNC_REFRESHABLE_FIELDS")
                .unwrap_or_else(default_sync_refreshable_fields),
            derived_fields: take_list(&mut layered, "SYNC_DERIVED_FIELDS")
                .unwrap_or_else(default_sync_derived_fields),
            estimated_page_seconds: take_parsed(&mut layered, "SYNC_ESTIMATED_PAGE_SECONDS")
                .unwrap_or_else(default_sync_estimated_page_seconds),
        };

        let proxy = ProxyConfig {
            urls: take_list(&mut layered, "PROXY_URLS").unwrap_or_default(),
            strategy: take_string(&mut layered, "PROXY_STRATEGY"),
            region: take_string(&mut layered, "PROXY_REGION"),
        };

        let config = AppConfig {
            profile,
            api_bind_addr: take_string(&mut layered, "API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(&mut layered, "DB_MAX_CONNECTIONS")
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
                .unwrap_or_else(default_db_acquire_timeout_ms),
            marketplace,
            fetch,
            sync,
            proxy,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered.remove(key).filter(|v| !v.trim().is_empty())
}

// Unparseable values fall back to the default, matching the lenient numeric handling
// of the rest of the loader.
fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
) -> Option<T> {
    layered.remove(key).and_then(|v| v.trim().parse().ok())
}

fn take_list(layered: &mut BTreeMap<String, String>, key: &str) -> Option<Vec<String>> {
    layered.remove(key).map(|list| {
        list.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
