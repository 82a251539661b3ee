//! nova_evidence
//!
//! The bounded, immutable evidence pack: every numeric value the LLM may
//! state, each carrying a full provenance chain back to exactly one verified
//! fetch. Narrative evidence strings ride alongside but are never a source
//! of numeric authority.

use serde::{Deserialize, Serialize};

use nova_lens::TruthMode;
use nova_providers::{FetchRecord, ProviderData, ProviderResult, ReliabilityTier};
use nova_telemetry::CorrelationContext;

pub const DEFAULT_MAX_TOKENS: usize = 50;

/// Canonical name tying a numeric value to its real-world referent,
/// e.g. `AAPL.price`, `USD/EUR.rate`, `new york.temperature_c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NumericContextKey(pub String);

impl NumericContextKey {
    pub fn new(subject: &str, measure: &str) -> Self {
        Self(format!("{subject}.{measure}"))
    }

    /// The subject half, used by the leak guard for context matching.
    pub fn subject(&self) -> &str {
        self.0.rsplit_once('.').map(|(s, _)| s).unwrap_or(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericToken {
    pub context_key: NumericContextKey,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub source: String,
    pub fetched_at: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    pub correlation: CorrelationContext,
    pub tokens: Vec<NumericToken>,
    pub narrative_evidence: Vec<String>,
    pub truth_mode: TruthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_category: Option<String>,
    pub fallback_mode: bool,
    /// True only when tokens exist and none are stale.
    pub numeric_precision_allowed: bool,
    /// True only in external truth mode with zero provider failures.
    pub action_recommendations_allowed: bool,
}

impl EvidencePack {
    pub fn token_for(&self, key: &str) -> Option<&NumericToken> {
        self.tokens.iter().find(|t| t.context_key.0 == key)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Accumulates fetches and seals into an immutable pack.
pub struct EvidencePackBuilder {
    correlation: CorrelationContext,
    truth_mode: TruthMode,
    primary_category: Option<String>,
    max_tokens: usize,
    tokens: Vec<NumericToken>,
    narrative: Vec<String>,
    provider_failures: u32,
    any_stale: bool,
    used_fallback: bool,
}

impl EvidencePackBuilder {
    pub fn new(correlation: CorrelationContext, truth_mode: TruthMode) -> Self {
        Self {
            correlation,
            truth_mode,
            primary_category: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            tokens: Vec::new(),
            narrative: Vec::new(),
            provider_failures: 0,
            any_stale: false,
            used_fallback: false,
        }
    }

    pub fn primary_category(mut self, category: impl Into<String>) -> Self {
        self.primary_category = Some(category.into());
        self
    }

    pub fn max_tokens(mut self, ceiling: usize) -> Self {
        self.max_tokens = ceiling;
        self
    }

    /// Fold one fetch record in: successful data becomes tokens + narrative,
    /// failures degrade the pack flags.
    pub fn add_fetch(&mut self, record: &FetchRecord, tier: Option<ReliabilityTier>) {
        match &record.result {
            ProviderResult::Ok { data, .. } => {
                if record.stale {
                    self.any_stale = true;
                }
                let confidence = base_confidence(tier, record.stale);
                self.add_data(data, &record.provider_name, record.fetched_at, confidence);
            }
            ProviderResult::Fail(_) => {
                self.provider_failures += 1;
            }
        }
    }

    pub fn mark_fallback(&mut self) {
        self.used_fallback = true;
    }

    fn add_data(&mut self, data: &ProviderData, source: &str, fetched_at: u64, confidence: f64) {
        match data {
            ProviderData::Market(stock) => {
                self.push_token(
                    NumericContextKey::new(&stock.symbol, "price"),
                    stock.current,
                    Some(stock.currency.clone()),
                    source,
                    fetched_at,
                    confidence,
                );
                self.push_token(
                    NumericContextKey::new(&stock.symbol, "change_pct"),
                    stock.percent_change,
                    Some("%".into()),
                    source,
                    fetched_at,
                    confidence,
                );
                self.narrative.push(format!(
                    "{} trading at {:.2} {} ({:+.2}%), day range {:.2}-{:.2} [{}]",
                    stock.symbol, stock.current, stock.currency, stock.percent_change, stock.low, stock.high, source
                ));
            }
            ProviderData::Crypto(crypto) => {
                self.push_token(
                    NumericContextKey::new(&crypto.symbol, "price"),
                    crypto.price_usd,
                    Some("USD".into()),
                    source,
                    fetched_at,
                    confidence,
                );
                if let Some(change) = crypto.change_24h_pct {
                    self.push_token(
                        NumericContextKey::new(&crypto.symbol, "change_24h_pct"),
                        change,
                        Some("%".into()),
                        source,
                        fetched_at,
                        confidence,
                    );
                }
                self.narrative.push(format!("{} at {:.2} USD [{}]", crypto.symbol, crypto.price_usd, source));
            }
            ProviderData::Fx(fx) => {
                self.push_token(
                    NumericContextKey::new(&format!("{}/{}", fx.base, fx.quote), "rate"),
                    fx.rate,
                    None,
                    source,
                    fetched_at,
                    confidence,
                );
                self.narrative.push(format!("1 {} = {:.4} {} [{}]", fx.base, fx.rate, fx.quote, source));
            }
            ProviderData::Weather(weather) => {
                self.push_token(
                    NumericContextKey::new(&weather.location, "temperature_c"),
                    weather.temperature_c,
                    Some("°C".into()),
                    source,
                    fetched_at,
                    confidence,
                );
                if let Some(humidity) = weather.humidity_pct {
                    self.push_token(
                        NumericContextKey::new(&weather.location, "humidity_pct"),
                        humidity,
                        Some("%".into()),
                        source,
                        fetched_at,
                        confidence,
                    );
                }
                self.narrative.push(format!(
                    "{}: {:.1}°C, {} [{}]",
                    weather.location, weather.temperature_c, weather.condition, source
                ));
            }
        }
    }

    fn push_token(
        &mut self,
        context_key: NumericContextKey,
        value: f64,
        unit: Option<String>,
        source: &str,
        fetched_at: u64,
        confidence: f64,
    ) {
        // Content addressing: (context_key, source, fetched_at). Keep the
        // freshest value for a given key+source.
        if let Some(existing) = self
            .tokens
            .iter_mut()
            .find(|t| t.context_key == context_key && t.source == source)
        {
            if fetched_at >= existing.fetched_at {
                existing.value = value;
                existing.unit = unit;
                existing.fetched_at = fetched_at;
                existing.confidence = confidence;
            }
            return;
        }
        self.tokens.push(NumericToken {
            context_key,
            value,
            unit,
            source: source.to_string(),
            fetched_at,
            confidence,
        });
    }

    /// Seal the pack. Enforces the size ceiling (lowest-confidence tokens
    /// dropped first) and derives the permission flags.
    pub fn seal(mut self) -> EvidencePack {
        if self.tokens.len() > self.max_tokens {
            self.tokens.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.fetched_at.cmp(&a.fetched_at))
            });
            self.tokens.truncate(self.max_tokens);
        }

        let numeric_precision_allowed = !self.tokens.is_empty() && !self.any_stale;
        let action_recommendations_allowed =
            self.truth_mode == TruthMode::External && self.provider_failures == 0 && !self.tokens.is_empty();

        EvidencePack {
            correlation: self.correlation,
            tokens: self.tokens,
            narrative_evidence: self.narrative,
            truth_mode: self.truth_mode,
            primary_category: self.primary_category,
            fallback_mode: self.used_fallback,
            numeric_precision_allowed,
            action_recommendations_allowed,
        }
    }
}

fn base_confidence(tier: Option<ReliabilityTier>, stale: bool) -> f64 {
    let base = match tier {
        Some(ReliabilityTier::Official) => 0.95,
        Some(ReliabilityTier::Feed) => 0.85,
        Some(ReliabilityTier::Community) => 0.7,
        None => 0.8,
    };
    if stale {
        base * 0.6
    } else {
        base
    }
}
