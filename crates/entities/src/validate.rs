//! Provider-backed entity validation with a bounded LRU cache.
//!
//! Entities already resolved with confidence at or above the skip threshold
//! are not re-validated. Cache: 1000 entries, 5 minute TTL, eviction in 10%
//! steps when full.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use nova_common::{Clock, SystemClock};
use nova_providers::{
    DataCategory, FetchCore, FetchQuery, ProviderErrorCode, ProviderRegistry, ProviderResult,
};

use crate::{EntityType, ResolvedEntity, ResolutionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    Unknown,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub validation_time_ms: u64,
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub cache_capacity: usize,
    pub cache_ttl_millis: u64,
    pub eviction_step_pct: usize,
    pub skip_confidence_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1_000,
            cache_ttl_millis: 5 * 60 * 1_000,
            eviction_step_pct: 10,
            skip_confidence_threshold: 0.85,
        }
    }
}

struct CachedValidation {
    status: ValidationStatus,
    provider: Option<String>,
    stored_at: u64,
}

pub struct EntityValidator {
    core: Arc<FetchCore>,
    registry: Arc<ProviderRegistry>,
    config: ValidatorConfig,
    cache: Mutex<LruCache<String, CachedValidation>>,
    clock: Arc<dyn Clock>,
}

impl EntityValidator {
    pub fn new(core: Arc<FetchCore>, registry: Arc<ProviderRegistry>, config: ValidatorConfig) -> Self {
        Self::with_clock(core, registry, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        core: Arc<FetchCore>,
        registry: Arc<ProviderRegistry>,
        config: ValidatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            core,
            registry,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    pub async fn validate(&self, entity: &ResolvedEntity, user_id: Option<&str>) -> ValidationOutcome {
        let started = Instant::now();

        if entity.status == ResolutionStatus::Resolved
            && entity.resolution_confidence >= self.config.skip_confidence_threshold
        {
            return ValidationOutcome {
                status: ValidationStatus::Skipped,
                provider: None,
                validation_time_ms: started.elapsed().as_millis() as u64,
                from_cache: false,
                suggestions: vec![],
            };
        }

        let (Some(canonical), Some(category)) = (&entity.canonical_id, entity.category) else {
            return ValidationOutcome {
                status: ValidationStatus::Unknown,
                provider: None,
                validation_time_ms: started.elapsed().as_millis() as u64,
                from_cache: false,
                suggestions: suggestions_for(entity),
            };
        };

        let cache_key = format!("{:?}:{canonical}", entity.entity_type);
        if let Some(hit) = self.cache_get(&cache_key) {
            return ValidationOutcome {
                status: hit.status,
                provider: hit.provider,
                validation_time_ms: started.elapsed().as_millis() as u64,
                from_cache: true,
                suggestions: vec![],
            };
        }

        let query = FetchQuery::new(canonical.clone(), category);
        let (record, _) = self.registry.fetch_category(&self.core, &query, user_id).await;
        let (status, provider) = match &record.result {
            ProviderResult::Ok { .. } => (ValidationStatus::Valid, Some(record.provider_name.clone())),
            ProviderResult::Fail(f) => match f.code {
                ProviderErrorCode::InvalidSymbol | ProviderErrorCode::SymbolNotFound => {
                    (ValidationStatus::Invalid, Some(record.provider_name.clone()))
                }
                _ => (ValidationStatus::Unknown, Some(record.provider_name.clone())),
            },
        };

        // Unknown outcomes are transient; do not poison the cache with them.
        if status != ValidationStatus::Unknown {
            self.cache_put(cache_key, status, provider.clone());
        }

        ValidationOutcome {
            status,
            provider,
            validation_time_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
            suggestions: if status == ValidationStatus::Invalid { suggestions_for(entity) } else { vec![] },
        }
    }

    fn cache_get(&self, key: &str) -> Option<ValidationOutcome> {
        let mut cache = self.cache.lock();
        let hit = cache.get(key)?;
        if self.clock.now_millis().saturating_sub(hit.stored_at) > self.config.cache_ttl_millis {
            cache.pop(key);
            return None;
        }
        Some(ValidationOutcome {
            status: hit.status,
            provider: hit.provider.clone(),
            validation_time_ms: 0,
            from_cache: true,
            suggestions: vec![],
        })
    }

    fn cache_put(&self, key: String, status: ValidationStatus, provider: Option<String>) {
        let mut cache = self.cache.lock();
        // Evict in steps of 10% of capacity rather than one-by-one churn.
        if cache.len() >= self.config.cache_capacity {
            let step = (self.config.cache_capacity * self.config.eviction_step_pct / 100).max(1);
            for _ in 0..step {
                if cache.pop_lru().is_none() {
                    break;
                }
            }
        }
        cache.put(key, CachedValidation { status, provider, stored_at: self.clock.now_millis() });
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Nearest-alias suggestions for invalid or unresolved entities.
fn suggestions_for(entity: &ResolvedEntity) -> Vec<String> {
    let raw = entity.raw_text.to_lowercase();
    match entity.entity_type {
        EntityType::Ticker => crate::COMPANY_ALIASES
            .iter()
            .filter(|(alias, _)| alias.starts_with(&raw) || raw.starts_with(alias))
            .map(|(_, sym)| sym.to_string())
            .collect(),
        EntityType::CryptoSymbol => crate::CRYPTO_ALIASES
            .iter()
            .filter(|(alias, _)| alias.starts_with(&raw))
            .map(|(_, sym)| sym.to_string())
            .collect(),
        _ => vec![],
    }
}
