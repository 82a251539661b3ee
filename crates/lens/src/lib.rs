//! nova_lens
//!
//! Decides, per user turn, whether the answer must be grounded in live
//! external data. Rule-based first (keyword + entity signals); an optional
//! LLM classifier is consulted only when the rules come back low-confidence.
//!
//! Greetings, general knowledge, opinions, and creative prompts never need
//! external data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nova_entities::{extract_entities, ResolvedEntity};
use nova_providers::DataCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthMode {
    Local,
    Hybrid,
    External,
}

impl TruthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruthMode::Local => "local",
            TruthMode::Hybrid => "hybrid",
            TruthMode::External => "external",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    RuleBased,
    Llm,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataNeed {
    Realtime,
    WebSearch,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub truth_mode: TruthMode,
    pub primary_category: Option<DataCategory>,
    pub categories: Vec<DataCategory>,
    pub confidence: ClassificationConfidence,
    pub method: ClassificationMethod,
    pub needs_external_data: bool,
    pub data_type: DataNeed,
}

impl Classification {
    fn local(confidence: ClassificationConfidence) -> Self {
        Self {
            truth_mode: TruthMode::Local,
            primary_category: None,
            categories: vec![],
            confidence,
            method: ClassificationMethod::RuleBased,
            needs_external_data: false,
            data_type: DataNeed::None,
        }
    }
}

/// Optional LLM fallback, consulted only on low-confidence rule outcomes.
#[async_trait]
pub trait LlmClassifier: Send + Sync {
    async fn classify(&self, message: &str) -> Option<Classification>;
}

// ----------------------------
// Keyword tables
// ----------------------------

const GREETINGS: &[&str] = &[
    "hello", "hi", "hey", "yo", "howdy", "good morning", "good afternoon", "good evening", "thanks", "thank you", "bye", "goodbye",
];

const OPINION_CUES: &[&str] =
    &["what do you think", "your opinion", "do you like", "do you prefer", "should i feel"];

const CREATIVE_CUES: &[&str] =
    &["write a poem", "write a story", "write me a", "compose a", "imagine a", "make up a story"];

const MARKET_CUES: &[&str] = &[
    "stock", "stocks", "share price", "trading at", "ticker", "market cap", "quote", "pre-market", "after hours", "earnings",
];

const CRYPTO_CUES: &[&str] = &["crypto", "bitcoin", "ethereum", "btc", "eth", "coin price", "token price"];

const FX_CUES: &[&str] = &["exchange rate", "convert", "conversion", "currency", "forex", "fx rate"];

const WEATHER_CUES: &[&str] =
    &["weather", "temperature", "forecast", "raining", "snowing", "humidity", "how hot", "how cold"];

const REALTIME_CUES: &[&str] =
    &["right now", "currently", "today", "latest", "live", "real-time", "real time", "at the moment"];

fn contains_cue(lowered: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| lowered.contains(cue))
}

// ----------------------------
// Classifier
// ----------------------------

#[derive(Default)]
pub struct LensClassifier {
    llm: Option<Box<dyn LlmClassifier>>,
}

impl LensClassifier {
    pub fn new() -> Self {
        Self { llm: None }
    }

    pub fn with_llm_fallback(llm: Box<dyn LlmClassifier>) -> Self {
        Self { llm: Some(llm) }
    }

    /// Classify one user message. Also returns the entities extracted along
    /// the way so the caller does not re-extract.
    pub async fn classify(&self, message: &str) -> (Classification, Vec<ResolvedEntity>) {
        let entities = extract_entities(message);
        let classification = rule_classify(message, &entities);

        if classification.confidence == ClassificationConfidence::Low {
            if let Some(llm) = &self.llm {
                if let Some(mut better) = llm.classify(message).await {
                    better.method = ClassificationMethod::Hybrid;
                    tracing::debug!(target: "lens", "rule classification was low-confidence, using llm fallback");
                    return (better, entities);
                }
            }
        }
        (classification, entities)
    }
}

fn rule_classify(message: &str, entities: &[ResolvedEntity]) -> Classification {
    let lowered = message.to_lowercase();
    let trimmed = lowered.trim();

    // Conversational turns short-circuit before any data signals.
    let is_greeting = GREETINGS.iter().any(|g| {
        trimmed == *g
            || trimmed.strip_suffix(['!', '.', '?']).map(|t| t.trim() == *g).unwrap_or(false)
    });
    if is_greeting {
        return Classification::local(ClassificationConfidence::High);
    }
    if contains_cue(&lowered, OPINION_CUES) || contains_cue(&lowered, CREATIVE_CUES) {
        return Classification::local(ClassificationConfidence::High);
    }

    // Category signals: keywords plus extracted entity categories.
    fn push(c: DataCategory, categories: &mut Vec<DataCategory>) {
        if !categories.contains(&c) {
            categories.push(c);
        }
    }
    let mut categories: Vec<DataCategory> = Vec::new();

    if contains_cue(&lowered, MARKET_CUES) {
        push(DataCategory::Market, &mut categories);
    }
    if contains_cue(&lowered, CRYPTO_CUES) {
        push(DataCategory::Crypto, &mut categories);
    }
    if contains_cue(&lowered, FX_CUES) {
        push(DataCategory::Fx, &mut categories);
    }
    if contains_cue(&lowered, WEATHER_CUES) {
        push(DataCategory::Weather, &mut categories);
    }
    for entity in entities {
        if let Some(category) = entity.category {
            push(category, &mut categories);
        }
    }

    if categories.is_empty() {
        // No data signal at all: general knowledge, low confidence unless the
        // message is clearly a question about stable facts.
        let confidence = if trimmed.len() < 120 {
            ClassificationConfidence::Medium
        } else {
            ClassificationConfidence::Low
        };
        return Classification::local(confidence);
    }

    let has_strong_entity = entities
        .iter()
        .any(|e| e.canonical_id.is_some() && e.resolution_confidence >= 0.6);
    let realtime_cue = contains_cue(&lowered, REALTIME_CUES) || contains_cue(&lowered, MARKET_CUES);

    let confidence = if has_strong_entity {
        ClassificationConfidence::High
    } else {
        ClassificationConfidence::Medium
    };
    let truth_mode = if has_strong_entity || realtime_cue { TruthMode::External } else { TruthMode::Hybrid };

    Classification {
        truth_mode,
        primary_category: categories.first().copied(),
        categories,
        confidence,
        method: ClassificationMethod::RuleBased,
        needs_external_data: true,
        data_type: DataNeed::Realtime,
    }
}
