//! The fetch core: every provider call funnels through here.
//!
//! Order of operations per call: cache lookup, rate-limit acquire, timed
//! HTTP call, error classification, cache write, latency attach. Retries
//! only on retryable failures, with exponential backoff x jitter x cap and
//! Retry-After override. A per-provider circuit breaker fails fast while a
//! provider is misbehaving.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nova_common::{Clock, SystemClock};
use nova_ratelimit::LayeredLimiter;
use nova_store::KeyValueStore;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::{
    normalize_query, DataCategory, FetchQuery, FetchRecord, LiveDataProvider, ProviderData,
    ProviderErrorCode, ProviderFailure, ProviderResult,
};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_millis: u64,
    pub max_backoff_millis: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1, base_backoff_millis: 200, max_backoff_millis: 5_000 }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_secs {
            return Duration::from_secs(secs);
        }
        let exp = self.base_backoff_millis.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0.5..1.5);
        let millis = ((exp as f64) * jitter) as u64;
        Duration::from_millis(millis.min(self.max_backoff_millis))
    }
}

/// Freshness TTLs per category, with a stale-serving grace where permitted.
/// Market quotes are never served stale; FX and weather may be.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub market_millis: u64,
    pub crypto_millis: u64,
    pub fx_millis: u64,
    pub weather_millis: u64,
    pub stale_grace_factor: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            market_millis: 30_000,
            crypto_millis: 30_000,
            fx_millis: 3_600_000,
            weather_millis: 600_000,
            stale_grace_factor: 4,
        }
    }
}

impl CacheTtls {
    fn freshness(&self, category: DataCategory) -> u64 {
        match category {
            DataCategory::Market => self.market_millis,
            DataCategory::Crypto => self.crypto_millis,
            DataCategory::Fx => self.fx_millis,
            DataCategory::Weather => self.weather_millis,
        }
    }

    fn allows_stale(&self, category: DataCategory) -> bool {
        matches!(category, DataCategory::Fx | DataCategory::Weather)
    }

    fn physical(&self, category: DataCategory) -> u64 {
        let fresh = self.freshness(category);
        if self.allows_stale(category) {
            fresh.saturating_mul(self.stale_grace_factor)
        } else {
            fresh
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchCoreConfig {
    pub retry: RetryPolicy,
    pub ttls: CacheTtls,
    pub breaker: CircuitBreakerConfig,
    pub default_timeout_millis: u64,
}

impl Default for FetchCoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ttls: CacheTtls::default(),
            breaker: CircuitBreakerConfig::default(),
            default_timeout_millis: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedFetch {
    data: ProviderData,
    fetched_at: u64,
}

pub struct FetchCore {
    store: Arc<dyn KeyValueStore>,
    limiter: Arc<LayeredLimiter>,
    config: FetchCoreConfig,
    breakers: parking_lot::Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
}

impl FetchCore {
    pub fn new(store: Arc<dyn KeyValueStore>, limiter: Arc<LayeredLimiter>, config: FetchCoreConfig) -> Self {
        Self::with_clock(store, limiter, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        limiter: Arc<LayeredLimiter>,
        config: FetchCoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, limiter, config, breakers: parking_lot::Mutex::new(HashMap::new()), clock }
    }

    pub fn breaker_for(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(self.config.breaker, self.clock.clone())))
            .clone()
    }

    pub async fn fetch(
        &self,
        provider: &Arc<dyn LiveDataProvider>,
        query: &FetchQuery,
        user_id: Option<&str>,
    ) -> FetchRecord {
        let name = provider.name().to_string();
        let cache_key = format!("{name}:{}", normalize_query(&query.query, query.category));

        // 1. Cache.
        if !query.bypass_cache {
            if let Some((cached, age)) = self.read_cache(&cache_key).await {
                if age <= self.config.ttls.freshness(query.category) {
                    return FetchRecord {
                        result: ProviderResult::Ok { data: cached.data, latency_ms: 0 },
                        from_cache: true,
                        stale: false,
                        provider_name: name,
                        fetched_at: cached.fetched_at,
                        cache_key,
                    };
                }
            }
        }

        // 2. Rate limit.
        let decision = self.limiter.try_acquire(&name, user_id);
        if !decision.allowed {
            let failure = ProviderFailure::new(ProviderErrorCode::RateLimited, "provider rate limit exceeded")
                .with_retry_after(decision.retry_after_ms.unwrap_or(0) / 1_000);
            return self.fail_with_stale_fallback(failure, &name, &cache_key, query).await;
        }

        // 3. Circuit breaker.
        let breaker = self.breaker_for(&name);
        if !breaker.allow() {
            let failure = ProviderFailure {
                code: ProviderErrorCode::FetchError,
                message: "circuit breaker open".to_string(),
                retryable: false,
                retry_after_secs: None,
            };
            return self.fail_with_stale_fallback(failure, &name, &cache_key, query).await;
        }

        // 4. Timed call with retries.
        let timeout = Duration::from_millis(query.timeout_millis.unwrap_or(self.config.default_timeout_millis));
        let mut attempt = 0u32;
        let failure = loop {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, provider.fetch(query)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let failure = match outcome {
                Ok(Ok(data)) => {
                    breaker.record_success();
                    let fetched_at = self.clock.now_millis();
                    self.write_cache(&cache_key, &data, query.category).await;
                    tracing::debug!(target: "providers", provider = %name, latency_ms, "fetch ok");
                    return FetchRecord {
                        result: ProviderResult::Ok { data, latency_ms },
                        from_cache: false,
                        stale: false,
                        provider_name: name,
                        fetched_at,
                        cache_key,
                    };
                }
                Ok(Err(failure)) => failure,
                Err(_) => ProviderFailure::new(ProviderErrorCode::Timeout, format!("timed out after {timeout:?}")),
            };

            breaker.record_failure();
            tracing::warn!(
                target: "providers",
                provider = %name,
                code = ?failure.code,
                attempt,
                "fetch attempt failed: {}",
                failure.message
            );

            if failure.retryable && attempt < self.config.retry.max_retries && breaker.allow() {
                let delay = self.config.retry.backoff(attempt, failure.retry_after_secs);
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            break failure;
        };

        self.fail_with_stale_fallback(failure, &name, &cache_key, query).await
    }

    async fn read_cache(&self, cache_key: &str) -> Option<(CachedFetch, u64)> {
        let bytes = self.store.get(cache_key).await.ok().flatten()?;
        let cached: CachedFetch = serde_json::from_slice(&bytes).ok()?;
        let age = self.clock.now_millis().saturating_sub(cached.fetched_at);
        Some((cached, age))
    }

    async fn write_cache(&self, cache_key: &str, data: &ProviderData, category: DataCategory) {
        let cached = CachedFetch { data: data.clone(), fetched_at: self.clock.now_millis() };
        if let Ok(bytes) = serde_json::to_vec(&cached) {
            let ttl = self.config.ttls.physical(category);
            if let Err(err) = self.store.set(cache_key, bytes, Some(ttl)).await {
                tracing::warn!(target: "providers", cache_key, "cache write failed: {err}");
            }
        }
    }

    /// On terminal failure, serve a stale cached value where category policy
    /// permits; otherwise surface the failure.
    async fn fail_with_stale_fallback(
        &self,
        failure: ProviderFailure,
        name: &str,
        cache_key: &str,
        query: &FetchQuery,
    ) -> FetchRecord {
        if self.config.ttls.allows_stale(query.category) && !query.bypass_cache {
            if let Some((cached, age)) = self.read_cache(cache_key).await {
                if age <= self.config.ttls.physical(query.category) {
                    tracing::info!(target: "providers", provider = %name, age_ms = age, "serving stale value after failure");
                    return FetchRecord {
                        result: ProviderResult::Ok { data: cached.data, latency_ms: 0 },
                        from_cache: true,
                        stale: true,
                        provider_name: name.to_string(),
                        fetched_at: cached.fetched_at,
                        cache_key: cache_key.to_string(),
                    };
                }
            }
        }
        FetchRecord {
            result: ProviderResult::Fail(failure),
            from_cache: false,
            stale: false,
            provider_name: name.to_string(),
            fetched_at: self.clock.now_millis(),
            cache_key: cache_key.to_string(),
        }
    }
}

// ----------------------------
// Registry
// ----------------------------

/// Providers grouped by category, ordered by reliability tier. The first
/// available provider is the primary; the rest are fallbacks, tried
/// sequentially.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LiveDataProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn LiveDataProvider>) {
        self.providers.push(provider);
    }

    pub fn providers_for(&self, category: DataCategory) -> Vec<Arc<dyn LiveDataProvider>> {
        let mut matching: Vec<Arc<dyn LiveDataProvider>> = self
            .providers
            .iter()
            .filter(|p| p.categories().contains(&category))
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.reliability_tier());
        matching
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Reliability tier of a registered provider, by name. Feeds token
    /// confidence when evidence is assembled from fetch records.
    pub fn tier_of(&self, provider_name: &str) -> Option<crate::ReliabilityTier> {
        self.providers
            .iter()
            .find(|p| p.name() == provider_name)
            .map(|p| p.reliability_tier())
    }

    /// Fetch through the tier ordering. Returns the first success, or the
    /// last failure when every candidate fails. The bool reports whether a
    /// fallback (non-primary) answered.
    pub async fn fetch_category(
        &self,
        core: &FetchCore,
        query: &FetchQuery,
        user_id: Option<&str>,
    ) -> (FetchRecord, bool) {
        let candidates = self.providers_for(query.category);
        let mut last: Option<FetchRecord> = None;
        for (i, provider) in candidates.iter().enumerate() {
            if !provider.is_available() {
                continue;
            }
            let record = core.fetch(provider, query, user_id).await;
            if record.result.is_ok() {
                return (record, i > 0);
            }
            last = Some(record);
        }
        match last {
            Some(record) => (record, false),
            None => (
                FetchRecord {
                    result: ProviderResult::Fail(ProviderFailure {
                        code: ProviderErrorCode::FetchError,
                        message: format!("no provider available for {}", query.category.as_str()),
                        retryable: false,
                        retry_after_secs: None,
                    }),
                    from_cache: false,
                    stale: false,
                    provider_name: String::new(),
                    fetched_at: 0,
                    cache_key: String::new(),
                },
                false,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nova_common::ManualClock;
    use nova_ratelimit::RateLimitConfig;
    use nova_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        name: String,
        tier: crate::ReliabilityTier,
        calls: AtomicU32,
        /// Fail the first `fail_first` calls with HTTP 5xx, then succeed.
        fail_first: u32,
        available: bool,
    }

    impl ScriptedProvider {
        fn new(name: &str, tier: crate::ReliabilityTier, fail_first: u32) -> Self {
            Self { name: name.into(), tier, calls: AtomicU32::new(0), fail_first, available: true }
        }
    }

    #[async_trait]
    impl LiveDataProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn categories(&self) -> &[DataCategory] {
            &[DataCategory::Market]
        }
        fn reliability_tier(&self) -> crate::ReliabilityTier {
            self.tier
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn fetch(&self, query: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ProviderFailure::new(ProviderErrorCode::Http5xx, "upstream 500"));
            }
            Ok(ProviderData::Market(crate::StockData {
                symbol: normalize_query(&query.query, query.category),
                current: 192.53,
                change: -0.41,
                percent_change: -0.21,
                high: 193.10,
                low: 191.40,
                open: 192.40,
                previous_close: 192.94,
                currency: "USD".into(),
            }))
        }
    }

    fn core_with(clock: Arc<ManualClock>, retry: RetryPolicy) -> FetchCore {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = Arc::new(LayeredLimiter::new(
            RateLimitConfig::new(100, 60_000),
            RateLimitConfig::new(50, 60_000),
            clock.clone(),
        ));
        FetchCore::with_clock(
            store,
            limiter,
            FetchCoreConfig { retry, ..Default::default() },
            clock,
        )
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy { max_retries: 1, base_backoff_millis: 1, max_backoff_millis: 2 }
    }

    #[tokio::test]
    async fn success_path_writes_cache_and_second_call_hits_it() {
        let clock = Arc::new(ManualClock::new(0));
        let core = core_with(clock.clone(), quick_retry());
        let provider: Arc<dyn LiveDataProvider> =
            Arc::new(ScriptedProvider::new("finnhub", crate::ReliabilityTier::Official, 0));

        let q = FetchQuery::new("AAPL", DataCategory::Market);
        let first = core.fetch(&provider, &q, Some("u1")).await;
        assert!(first.result.is_ok());
        assert!(!first.from_cache);

        let second = core.fetch(&provider, &q, Some("u1")).await;
        assert!(second.result.is_ok());
        assert!(second.from_cache);
        assert!(!second.stale);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_then_succeeds() {
        let clock = Arc::new(ManualClock::new(0));
        let core = core_with(clock, quick_retry());
        let provider: Arc<dyn LiveDataProvider> =
            Arc::new(ScriptedProvider::new("finnhub", crate::ReliabilityTier::Official, 1));

        let q = FetchQuery::new("AAPL", DataCategory::Market);
        let record = core.fetch(&provider, &q, None).await;
        assert!(record.result.is_ok());
    }

    #[tokio::test]
    async fn two_consecutive_500s_open_the_breaker() {
        let clock = Arc::new(ManualClock::new(0));
        let core = core_with(clock, quick_retry());
        let provider: Arc<dyn LiveDataProvider> =
            Arc::new(ScriptedProvider::new("finnhub", crate::ReliabilityTier::Official, 10));

        let q = FetchQuery::new("AAPL", DataCategory::Market);
        let record = core.fetch(&provider, &q, None).await;
        assert!(!record.result.is_ok());
        assert_eq!(core.breaker_for("finnhub").state(), crate::BreakerState::Open);

        // Subsequent call fails fast without touching the provider.
        let fast = core.fetch(&provider, &q, None).await;
        match fast.result {
            ProviderResult::Fail(f) => assert!(f.message.contains("circuit breaker")),
            _ => panic!("expected fast failure"),
        }
    }

    #[tokio::test]
    async fn market_data_is_never_served_stale() {
        let clock = Arc::new(ManualClock::new(0));
        let core = core_with(clock.clone(), quick_retry());
        let good: Arc<dyn LiveDataProvider> =
            Arc::new(ScriptedProvider::new("finnhub", crate::ReliabilityTier::Official, 0));
        let q = FetchQuery::new("AAPL", DataCategory::Market);
        assert!(core.fetch(&good, &q, None).await.result.is_ok());

        // Let the cache expire, then fail: no stale fallback for market.
        clock.advance(CacheTtls::default().market_millis + 1);
        let bad: Arc<dyn LiveDataProvider> =
            Arc::new(ScriptedProvider::new("finnhub", crate::ReliabilityTier::Official, 10));
        let record = core.fetch(&bad, &q, None).await;
        assert!(!record.result.is_ok());
        assert!(!record.stale);
    }

    #[tokio::test]
    async fn fx_is_served_stale_after_provider_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let core = core_with(clock.clone(), quick_retry());

        struct FxProvider {
            fail: std::sync::atomic::AtomicBool,
        }
        #[async_trait]
        impl LiveDataProvider for FxProvider {
            fn name(&self) -> &str {
                "exchangerate"
            }
            fn categories(&self) -> &[DataCategory] {
                &[DataCategory::Fx]
            }
            fn reliability_tier(&self) -> crate::ReliabilityTier {
                crate::ReliabilityTier::Feed
            }
            async fn fetch(&self, _q: &FetchQuery) -> Result<ProviderData, ProviderFailure> {
                if self.fail.load(Ordering::SeqCst) {
                    Err(ProviderFailure::new(ProviderErrorCode::Http5xx, "down"))
                } else {
                    Ok(ProviderData::Fx(crate::FxData { base: "USD".into(), quote: "EUR".into(), rate: 0.92 }))
                }
            }
        }

        let fx = Arc::new(FxProvider { fail: std::sync::atomic::AtomicBool::new(false) });
        let provider: Arc<dyn LiveDataProvider> = fx.clone();
        let q = FetchQuery::new("USD/EUR", DataCategory::Fx);
        assert!(core.fetch(&provider, &q, None).await.result.is_ok());

        // Past freshness but inside the stale grace.
        clock.advance(CacheTtls::default().fx_millis + 1);
        fx.fail.store(true, Ordering::SeqCst);
        let record = core.fetch(&provider, &q, None).await;
        assert!(record.result.is_ok());
        assert!(record.stale);
    }

    #[test]
    fn registry_reports_tier_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new("official", crate::ReliabilityTier::Official, 0)));
        registry.register(Arc::new(ScriptedProvider::new("community", crate::ReliabilityTier::Community, 0)));

        assert_eq!(registry.tier_of("official"), Some(crate::ReliabilityTier::Official));
        assert_eq!(registry.tier_of("community"), Some(crate::ReliabilityTier::Community));
        assert_eq!(registry.tier_of("unknown"), None);
    }

    #[tokio::test]
    async fn registry_falls_back_in_tier_order() {
        let clock = Arc::new(ManualClock::new(0));
        let core = core_with(clock, quick_retry());

        let mut registry = ProviderRegistry::new();
        // Community-tier provider registered first must not win.
        registry.register(Arc::new(ScriptedProvider::new("community", crate::ReliabilityTier::Community, 0)));
        registry.register(Arc::new(ScriptedProvider::new("official", crate::ReliabilityTier::Official, 10)));

        let q = FetchQuery::new("AAPL", DataCategory::Market);
        let (record, used_fallback) = registry.fetch_category(&core, &q, None).await;
        assert!(record.result.is_ok());
        assert_eq!(record.provider_name, "community");
        assert!(used_fallback);
    }

    #[tokio::test]
    async fn provider_rate_limit_denies_with_code() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = Arc::new(LayeredLimiter::new(
            RateLimitConfig::new(1, 60_000),
            RateLimitConfig::new(50, 60_000),
            clock.clone(),
        ));
        let core = FetchCore::with_clock(store, limiter, FetchCoreConfig::default(), clock);
        let provider: Arc<dyn LiveDataProvider> =
            Arc::new(ScriptedProvider::new("finnhub", crate::ReliabilityTier::Official, 0));

        let q = FetchQuery::new("AAPL", DataCategory::Market);
        assert!(core.fetch(&provider, &q, None).await.result.is_ok());

        // Bypass cache so the second call needs a fresh slot.
        let q2 = FetchQuery { bypass_cache: true, ..FetchQuery::new("AAPL", DataCategory::Market) };
        let denied = core.fetch(&provider, &q2, None).await;
        match denied.result {
            ProviderResult::Fail(f) => assert_eq!(f.code, ProviderErrorCode::RateLimited),
            _ => panic!("expected rate-limited failure"),
        }
    }
}
