//! nova_llm
//!
//! The LLM security client. Every model call goes through one pipeline:
//! sanitize, budget tokens, truncate, dispatch under a deadline, circuit
//! break, validate the response, audit. The client is stateless per request
//! except for the circuit breaker and the optional response cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod adapter;
pub mod client;
pub mod truncate;

pub use adapter::{LlmAdapter, LlmReply, LlmUsage, OpenAiCompatAdapter};
pub use client::{CurriculumGuardContext, LlmClientConfig, LlmRequest, LlmResponse, LlmSecurityClient};
pub use truncate::{estimate_tokens, smart_truncate, truncate_messages};

// ----------------------------
// Purposes and budgets
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmPurpose {
    CurriculumStructuring,
    GoalRefinement,
    StepGeneration,
    SparkCreation,
    ContentSummary,
    DifficultyAssessment,
    Test,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PurposeBudget {
    pub max_tokens_input: u64,
    pub max_tokens_output: u64,
    pub timeout_millis: u64,
    pub priority: u8,
}

impl LlmPurpose {
    pub fn budget(&self) -> PurposeBudget {
        match self {
            LlmPurpose::CurriculumStructuring => {
                PurposeBudget { max_tokens_input: 8_000, max_tokens_output: 4_000, timeout_millis: 45_000, priority: 2 }
            }
            LlmPurpose::GoalRefinement => {
                PurposeBudget { max_tokens_input: 2_000, max_tokens_output: 1_000, timeout_millis: 20_000, priority: 3 }
            }
            LlmPurpose::StepGeneration => {
                PurposeBudget { max_tokens_input: 4_000, max_tokens_output: 2_000, timeout_millis: 30_000, priority: 3 }
            }
            LlmPurpose::SparkCreation => {
                PurposeBudget { max_tokens_input: 3_000, max_tokens_output: 1_500, timeout_millis: 25_000, priority: 4 }
            }
            LlmPurpose::ContentSummary => {
                PurposeBudget { max_tokens_input: 6_000, max_tokens_output: 1_000, timeout_millis: 30_000, priority: 5 }
            }
            LlmPurpose::DifficultyAssessment => {
                PurposeBudget { max_tokens_input: 2_000, max_tokens_output: 500, timeout_millis: 15_000, priority: 5 }
            }
            LlmPurpose::Test => {
                PurposeBudget { max_tokens_input: 1_000, max_tokens_output: 500, timeout_millis: 5_000, priority: 9 }
            }
        }
    }
}

// ----------------------------
// Messages
// ----------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system" | "user" | "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// Shallow response contract: either free text or JSON with required keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpectedSchema {
    Text,
    Json {
        #[serde(default)]
        required_fields: Vec<String>,
    },
}

// ----------------------------
// Errors + audit
// ----------------------------

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("prompt blocked by sanitizer")]
    SanitizationBlocked { patterns: Vec<String> },
    #[error("input exceeds token budget even after truncation")]
    TokenLimitExceeded,
    #[error("model call timed out after {0} ms")]
    Timeout(u64),
    #[error("llm circuit breaker open")]
    CircuitOpen,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("response failed schema validation: {0}")]
    SchemaInvalid(String),
    #[error("critical hallucination persisted after regeneration")]
    HallucinationDetected { report: nova_guard::HallucinationReport },
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::SanitizationBlocked { .. } => "SANITIZATION_BLOCKED",
            LlmError::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            LlmError::Timeout(_) => "TIMEOUT",
            LlmError::CircuitOpen => "PROVIDER_ERROR",
            LlmError::Provider(_) => "PROVIDER_ERROR",
            LlmError::SchemaInvalid(_) => "PROVIDER_ERROR",
            LlmError::HallucinationDetected { .. } => "HALLUCINATION_DETECTED",
        }
    }
}

/// Everything worth remembering about one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAudit {
    pub purpose: LlmPurpose,
    pub patterns_detected: Vec<String>,
    pub prompt_was_modified: bool,
    pub estimated_input_tokens: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub schema_valid: bool,
    pub hallucination_critical: bool,
    pub latency_ms: u64,
    pub outcome_code: String,
}
