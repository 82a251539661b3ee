//! Provider adapters. Transport + normalization ONLY; the security client
//! owns sanitization, budgets, deadlines, and auditing.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ChatMessage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: LlmUsage,
    /// Raw provider request id if present; hashed before it reaches audit.
    pub provider_request_id: Option<String>,
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn dispatch(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u64,
    ) -> Result<LlmReply, String>;
}

// ----------------------------
// OpenAI-compatible adapter
// ----------------------------

pub struct OpenAiCompatAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatAdapter {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self { client: Client::new(), base_url, api_key, model }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiCompatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u64,
    temperature: f64,
}

#[async_trait]
impl LlmAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn dispatch(
        &self,
        messages: &[ChatMessage],
        max_output_tokens: u64,
    ) -> Result<LlmReply, String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAiCompatRequest {
            model: &self.model,
            messages,
            max_tokens: max_output_tokens,
            temperature: 0.2,
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                request = request.bearer_auth(key);
            }
        }
        let response = request.send().await.map_err(|e| format!("transport: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("upstream status {}", response.status()));
        }
        let raw: Value = response.json().await.map_err(|e| format!("bad json: {e}"))?;

        // Normalize minimal shape: choices[0].message.content, finish_reason, usage.
        let content = raw
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing choices[0].message.content".to_string())?
            .to_string();
        let finish_reason = raw
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let input_tokens = raw.pointer("/usage/prompt_tokens").and_then(Value::as_u64);
        let output_tokens = raw.pointer("/usage/completion_tokens").and_then(Value::as_u64);
        let provider_request_id = raw.get("id").and_then(Value::as_str).map(str::to_string);

        Ok(LlmReply {
            content,
            finish_reason,
            usage: LlmUsage { input_tokens, output_tokens },
            provider_request_id,
        })
    }
}
