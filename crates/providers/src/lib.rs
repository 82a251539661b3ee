//! nova_providers
//!
//! Uniform live-data fetch contract plus the core wrapper that every call
//! goes through: cache, rate limit, timeout, retry, circuit breaker,
//! reliability-tier fallback.
//!
//! Providers do transport + normalization ONLY. No policy, no audit;
//! those live above this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod breaker;
pub mod fetch;
pub mod http;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use fetch::{CacheTtls, FetchCore, FetchCoreConfig, ProviderRegistry, RetryPolicy};
pub use http::{CoinGeckoProvider, ExchangeRateProvider, FinnhubProvider, OpenWeatherMapProvider};

// ----------------------------
// Categories and tiers
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Market,
    Crypto,
    Fx,
    Weather,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Market => "market",
            DataCategory::Crypto => "crypto",
            DataCategory::Fx => "fx",
            DataCategory::Weather => "weather",
        }
    }
}

/// Ordering over providers within a category. Official beats feed beats
/// community when picking primaries and fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityTier {
    Official,
    Feed,
    Community,
}

// ----------------------------
// Typed category data
// ----------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockData {
    pub symbol: String,
    pub current: f64,
    pub change: f64,
    pub percent_change: f64,
    pub high: f64,
    pub low: f64,
    pub open: f64,
    pub previous_close: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxData {
    pub base: String,
    pub quote: String,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherData {
    pub location: String,
    pub temperature_c: f64,
    pub condition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoData {
    pub symbol: String,
    pub price_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_24h_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ProviderData {
    Market(StockData),
    Crypto(CryptoData),
    Fx(FxData),
    Weather(WeatherData),
}

impl ProviderData {
    pub fn category(&self) -> DataCategory {
        match self {
            ProviderData::Market(_) => DataCategory::Market,
            ProviderData::Crypto(_) => DataCategory::Crypto,
            ProviderData::Fx(_) => DataCategory::Fx,
            ProviderData::Weather(_) => DataCategory::Weather,
        }
    }
}

// ----------------------------
// Errors and results
// ----------------------------

/// Stable error taxonomy. This is the only compatibility commitment the
/// fetch core makes about provider wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderErrorCode {
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "INVALID_SYMBOL")]
    InvalidSymbol,
    #[serde(rename = "SYMBOL_NOT_FOUND")]
    SymbolNotFound,
    #[serde(rename = "HTTP_4xx")]
    Http4xx,
    #[serde(rename = "HTTP_5xx")]
    Http5xx,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "FETCH_ERROR")]
    FetchError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub code: ProviderErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ProviderFailure {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        let retryable = matches!(
            code,
            ProviderErrorCode::RateLimited | ProviderErrorCode::Http5xx | ProviderErrorCode::Timeout
        );
        Self { code, message: message.into(), retryable, retry_after_secs: None }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderResult {
    Ok { data: ProviderData, latency_ms: u64 },
    Fail(ProviderFailure),
}

impl ProviderResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProviderResult::Ok { .. })
    }

    pub fn data(&self) -> Option<&ProviderData> {
        match self {
            ProviderResult::Ok { data, .. } => Some(data),
            ProviderResult::Fail(_) => None,
        }
    }
}

/// What the fetch core hands back for each call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRecord {
    pub result: ProviderResult,
    pub from_cache: bool,
    /// Set when the hit was past its freshness TTL but within the stale grace.
    pub stale: bool,
    pub provider_name: String,
    pub fetched_at: u64,
    pub cache_key: String,
}

#[derive(Debug, Clone)]
pub struct FetchQuery {
    pub query: String,
    pub category: DataCategory,
    pub bypass_cache: bool,
    pub timeout_millis: Option<u64>,
}

impl FetchQuery {
    pub fn new(query: impl Into<String>, category: DataCategory) -> Self {
        Self { query: query.into(), category, bypass_cache: false, timeout_millis: None }
    }
}

// ----------------------------
// Provider contract
// ----------------------------

#[async_trait]
pub trait LiveDataProvider: Send + Sync {
    fn name(&self) -> &str;
    fn categories(&self) -> &[DataCategory];
    fn reliability_tier(&self) -> ReliabilityTier;
    fn is_available(&self) -> bool {
        true
    }
    /// One transport round trip. The core wrapper owns cache/retry/limits.
    async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure>;
}

/// Cache keys are `provider:normalized-query`; normalization keeps symbol
/// queries case-insensitive and location queries whitespace-insensitive.
pub fn normalize_query(query: &str, category: DataCategory) -> String {
    let trimmed = query.trim();
    match category {
        DataCategory::Market | DataCategory::Crypto | DataCategory::Fx => {
            trimmed.to_uppercase().replace(char::is_whitespace, "")
        }
        DataCategory::Weather => trimmed.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" "),
    }
}
