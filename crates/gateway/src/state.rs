//! Application state: the dependency container, built once at startup.

use std::sync::Arc;

use async_trait::async_trait;
use nova_audit_log::AuditStore;
use nova_auth::{Authorizer, OwnershipRegistry};
use nova_common::epoch_millis;
use nova_entities::{EntityValidator, ValidatorConfig};
use nova_gate::{GateConfig, LensGate};
use nova_lens::LensClassifier;
use nova_llm::{LlmClientConfig, LlmSecurityClient, OpenAiCompatAdapter};
use nova_providers::{
    CoinGeckoProvider, ExchangeRateProvider, FetchCore, FetchCoreConfig, FinnhubProvider,
    OpenWeatherMapProvider, ProviderRegistry,
};
use nova_ratelimit::{LayeredLimiter, RateLimitConfig, TierLimiter, TierLimits};
use nova_redaction::{PromptSanitizer, SanitizerConfig};
use nova_store::{KeyValueStore, MemoryStore, StoreError};
use nova_telemetry::{DependencyCheck, HealthCheckResult, HealthRegistry, HealthStatus};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<LensGate>,
    pub tier_limiter: Arc<TierLimiter>,
    pub health: Arc<HealthRegistry>,
    pub audit: AuditStore,
    /// When false, anonymous traffic is admitted with an anonymous principal.
    pub require_auth: bool,
}

impl AppState {
    /// Build the full container from environment configuration.
    pub fn from_env() -> Result<Self, String> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let clock: Arc<dyn nova_common::Clock> = Arc::new(nova_common::SystemClock);

        let limiter = Arc::new(LayeredLimiter::new(
            RateLimitConfig::new(60, 60_000),
            RateLimitConfig::new(20, 60_000),
            clock.clone(),
        ));
        let fetch_core = Arc::new(FetchCore::new(store.clone(), limiter, FetchCoreConfig::default()));

        let mut registry = ProviderRegistry::new();
        if let Ok(key) = std::env::var("FINNHUB_API_KEY") {
            registry.register(Arc::new(FinnhubProvider::new(key)));
        }
        if let Ok(key) = std::env::var("OPENWEATHERMAP_API_KEY") {
            registry.register(Arc::new(OpenWeatherMapProvider::new(key)));
        }
        registry.register(Arc::new(ExchangeRateProvider::default()));
        registry.register(Arc::new(CoinGeckoProvider::default()));
        let registry = Arc::new(registry);

        let validator = Arc::new(EntityValidator::new(
            fetch_core.clone(),
            registry.clone(),
            ValidatorConfig::default(),
        ));

        let audit = AuditStore::new(store.clone());
        let authorizer = Arc::new(Authorizer::new(audit.clone(), OwnershipRegistry::new()));

        let max_len = std::env::var("MAX_MESSAGE_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(nova_redaction::sanitize::MAX_INPUT_CHARS);
        let sanitizer = PromptSanitizer::new(SanitizerConfig { max_input_chars: max_len, ..Default::default() });

        let adapter = Arc::new(OpenAiCompatAdapter::new(
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".into()),
            std::env::var("OPENAI_API_KEY").ok(),
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        ));
        let llm = Arc::new(LlmSecurityClient::new(adapter, sanitizer, LlmClientConfig::default()));

        let environment = std::env::var("NOVA_ENV").unwrap_or_else(|_| "development".into());
        let gate = Arc::new(LensGate::new(
            registry,
            fetch_core,
            validator,
            Arc::new(LensClassifier::new()),
            llm.clone(),
            audit.clone(),
            authorizer,
            GateConfig { environment, ..Default::default() },
        ));

        let tier_limiter = Arc::new(TierLimiter::new(TierLimits::default(), clock));

        let mut health = HealthRegistry::new();
        health.register("store", true, Arc::new(StoreCheck { store: store.clone() }));
        health.register("llm_breaker", false, Arc::new(LlmBreakerCheck { llm }));
        let health = Arc::new(health);

        let require_auth = std::env::var("NOVA_REQUIRE_AUTH")
            .map(|v| v != "false")
            .unwrap_or(true);

        Ok(Self { gate, tier_limiter, health, audit, require_auth })
    }
}

// ----------------------------
// Dependency checks
// ----------------------------

struct StoreCheck {
    store: Arc<dyn KeyValueStore>,
}

#[async_trait]
impl DependencyCheck for StoreCheck {
    async fn check(&self) -> HealthCheckResult {
        let probe = async {
            self.store.set("health:probe", b"ok".to_vec(), Some(10_000)).await?;
            self.store.get("health:probe").await
        };
        match probe.await {
            Ok(Some(_)) => HealthCheckResult {
                status: HealthStatus::Healthy,
                details: None,
                error: None,
                checked_at: epoch_millis(),
            },
            Ok(None) => HealthCheckResult {
                status: HealthStatus::Degraded,
                details: None,
                error: Some("probe key missing after write".into()),
                checked_at: epoch_millis(),
            },
            Err(e) => store_error(e),
        }
    }
}

fn store_error(e: StoreError) -> HealthCheckResult {
    HealthCheckResult {
        status: HealthStatus::Unhealthy,
        details: None,
        error: Some(e.to_string()),
        checked_at: epoch_millis(),
    }
}

struct LlmBreakerCheck {
    llm: Arc<LlmSecurityClient>,
}

#[async_trait]
impl DependencyCheck for LlmBreakerCheck {
    async fn check(&self) -> HealthCheckResult {
        let status = match self.llm.breaker_state() {
            nova_providers::BreakerState::Closed => HealthStatus::Healthy,
            nova_providers::BreakerState::HalfOpen => HealthStatus::Degraded,
            nova_providers::BreakerState::Open => HealthStatus::Unhealthy,
        };
        HealthCheckResult { status, details: None, error: None, checked_at: epoch_millis() }
    }
}
