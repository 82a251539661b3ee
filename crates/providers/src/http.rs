//! Concrete HTTP providers. Wire formats are consumed verbatim and
//! normalized into the typed category data; the only stable commitment is
//! the error-code taxonomy.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use crate::{
    CryptoData, DataCategory, FetchQuery, FxData, LiveDataProvider, ProviderData,
    ProviderErrorCode, ProviderFailure, ReliabilityTier, StockData, WeatherData,
};

/// Map an HTTP status to the stable taxonomy, honoring Retry-After.
fn classify_status(status: StatusCode, response: &Response) -> ProviderFailure {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let failure = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderFailure::new(ProviderErrorCode::RateLimited, "provider returned 429")
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderFailure::new(ProviderErrorCode::Unauthorized, format!("provider returned {status}"))
        }
        StatusCode::NOT_FOUND => {
            ProviderFailure::new(ProviderErrorCode::SymbolNotFound, "provider returned 404")
        }
        s if s.is_client_error() => {
            ProviderFailure::new(ProviderErrorCode::Http4xx, format!("provider returned {s}"))
        }
        s if s.is_server_error() => {
            ProviderFailure::new(ProviderErrorCode::Http5xx, format!("provider returned {s}"))
        }
        s => ProviderFailure::new(ProviderErrorCode::FetchError, format!("unexpected status {s}")),
    };
    match retry_after {
        Some(secs) => failure.with_retry_after(secs),
        None => failure,
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderFailure {
    if err.is_timeout() {
        ProviderFailure::new(ProviderErrorCode::Timeout, "transport timeout")
    } else {
        ProviderFailure::new(ProviderErrorCode::FetchError, format!("transport error: {err}"))
    }
}

fn f64_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

// ----------------------------
// Finnhub (stock quotes, official tier)
// ----------------------------

pub struct FinnhubProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl FinnhubProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://finnhub.io/api/v1".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { client: Client::new(), base_url, api_key }
    }
}

#[async_trait]
impl LiveDataProvider for FinnhubProvider {
    fn name(&self) -> &str {
        "finnhub"
    }

    fn categories(&self) -> &[DataCategory] {
        &[DataCategory::Market]
    }

    fn reliability_tier(&self) -> ReliabilityTier {
        ReliabilityTier::Official
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
        let symbol = crate::normalize_query(&query.query, DataCategory::Market);
        let url = format!("{}/quote", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[("symbol", symbol.as_str()), ("token", self.api_key.as_str())])
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_status(status, &response));
        }

        // Shape: {c, d, dp, h, l, o, pc}. Finnhub answers all-zero for
        // symbols it does not know instead of a 404.
        let raw: Value = response.json().await.map_err(classify_transport)?;
        let current = f64_field(&raw, "c")
            .ok_or_else(|| ProviderFailure::new(ProviderErrorCode::FetchError, "missing field c"))?;
        let previous_close = f64_field(&raw, "pc").unwrap_or(0.0);
        if current == 0.0 && previous_close == 0.0 {
            return Err(ProviderFailure::new(
                ProviderErrorCode::InvalidSymbol,
                format!("finnhub has no quote for {symbol}"),
            ));
        }

        Ok(ProviderData::Market(StockData {
            symbol,
            current,
            change: f64_field(&raw, "d").unwrap_or(0.0),
            percent_change: f64_field(&raw, "dp").unwrap_or(0.0),
            high: f64_field(&raw, "h").unwrap_or(0.0),
            low: f64_field(&raw, "l").unwrap_or(0.0),
            open: f64_field(&raw, "o").unwrap_or(0.0),
            previous_close,
            currency: "USD".to_string(),
        }))
    }
}

// ----------------------------
// exchangerate.host (FX, feed tier)
// ----------------------------

pub struct ExchangeRateProvider {
    client: Client,
    base_url: String,
}

impl Default for ExchangeRateProvider {
    fn default() -> Self {
        Self::with_base_url("https://api.exchangerate.host".to_string())
    }
}

impl ExchangeRateProvider {
    pub fn with_base_url(base_url: String) -> Self {
        Self { client: Client::new(), base_url }
    }
}

#[async_trait]
impl LiveDataProvider for ExchangeRateProvider {
    fn name(&self) -> &str {
        "exchangerate"
    }

    fn categories(&self) -> &[DataCategory] {
        &[DataCategory::Fx]
    }

    fn reliability_tier(&self) -> ReliabilityTier {
        ReliabilityTier::Feed
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
        // Queries arrive canonicalized as "USD/EUR".
        let pair = crate::normalize_query(&query.query, DataCategory::Fx);
        let (base, quote) = pair.split_once('/').ok_or_else(|| {
            ProviderFailure::new(ProviderErrorCode::InvalidSymbol, format!("not a currency pair: {pair}"))
        })?;

        let url = format!("{}/convert", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[("from", base), ("to", quote)])
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_status(status, &response));
        }

        let raw: Value = response.json().await.map_err(classify_transport)?;
        let rate = raw
            .get("result")
            .and_then(Value::as_f64)
            .or_else(|| raw.pointer("/info/rate").and_then(Value::as_f64))
            .ok_or_else(|| ProviderFailure::new(ProviderErrorCode::FetchError, "missing conversion result"))?;

        Ok(ProviderData::Fx(FxData { base: base.to_string(), quote: quote.to_string(), rate }))
    }
}

// ----------------------------
// OpenWeatherMap (weather, official tier)
// ----------------------------

pub struct OpenWeatherMapProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherMapProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.openweathermap.org/data/2.5".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { client: Client::new(), base_url, api_key }
    }
}

#[async_trait]
impl LiveDataProvider for OpenWeatherMapProvider {
    fn name(&self) -> &str {
        "openweathermap"
    }

    fn categories(&self) -> &[DataCategory] {
        &[DataCategory::Weather]
    }

    fn reliability_tier(&self) -> ReliabilityTier {
        ReliabilityTier::Official
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
        let location = crate::normalize_query(&query.query, DataCategory::Weather);
        let url = format!("{}/weather", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[
                ("q", location.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_status(status, &response));
        }

        let raw: Value = response.json().await.map_err(classify_transport)?;
        let temperature_c = raw
            .pointer("/main/temp")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderFailure::new(ProviderErrorCode::FetchError, "missing main.temp"))?;
        let condition = raw
            .pointer("/weather/0/description")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        Ok(ProviderData::Weather(WeatherData {
            location,
            temperature_c,
            condition,
            humidity_pct: raw.pointer("/main/humidity").and_then(Value::as_f64),
        }))
    }
}

// ----------------------------
// CoinGecko (crypto spot, feed tier)
// ----------------------------

pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
}

impl Default for CoinGeckoProvider {
    fn default() -> Self {
        Self::with_base_url("https://api.coingecko.com/api/v3".to_string())
    }
}

impl CoinGeckoProvider {
    pub fn with_base_url(base_url: String) -> Self {
        Self { client: Client::new(), base_url }
    }

    /// CoinGecko keys by slug, not ticker.
    fn slug_for(symbol: &str) -> Option<&'static str> {
        match symbol {
            "BTC" => Some("bitcoin"),
            "ETH" => Some("ethereum"),
            "SOL" => Some("solana"),
            "ADA" => Some("cardano"),
            "DOGE" => Some("dogecoin"),
            "XRP" => Some("ripple"),
            _ => None,
        }
    }
}

#[async_trait]
impl LiveDataProvider for CoinGeckoProvider {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn categories(&self) -> &[DataCategory] {
        &[DataCategory::Crypto]
    }

    fn reliability_tier(&self) -> ReliabilityTier {
        ReliabilityTier::Feed
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
        let symbol = crate::normalize_query(&query.query, DataCategory::Crypto);
        let slug = Self::slug_for(&symbol).ok_or_else(|| {
            ProviderFailure::new(ProviderErrorCode::SymbolNotFound, format!("unknown crypto symbol {symbol}"))
        })?;

        let url = format!("{}/simple/price", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[
                ("ids", slug),
                ("vs_currencies", "usd"),
                ("include_24hr_change", "true"),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_status(status, &response));
        }

        let raw: Value = response.json().await.map_err(classify_transport)?;
        let price_usd = raw
            .pointer(&format!("/{slug}/usd"))
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderFailure::new(ProviderErrorCode::FetchError, "missing usd price"))?;

        Ok(ProviderData::Crypto(CryptoData {
            symbol,
            price_usd,
            change_24h_pct: raw.pointer(&format!("/{slug}/usd_24h_change")).and_then(Value::as_f64),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finnhub_unavailable_without_key() {
        let p = FinnhubProvider::new(String::new());
        assert!(!p.is_available());
        let p2 = FinnhubProvider::new("k".into());
        assert!(p2.is_available());
    }

    #[test]
    fn coingecko_slugs_cover_major_symbols() {
        assert_eq!(CoinGeckoProvider::slug_for("BTC"), Some("bitcoin"));
        assert_eq!(CoinGeckoProvider::slug_for("ETH"), Some("ethereum"));
        assert_eq!(CoinGeckoProvider::slug_for("NOPE"), None);
    }
}
