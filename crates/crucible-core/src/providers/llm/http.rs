//! OpenAI-compatible chat transport.
//!
//! Works against any endpoint speaking the `/chat/completions` shape,
//! which covers every provider the batch planner targets. Errors are
//! classified here, at the boundary, so the rest of the harness only ever
//! sees typed [`ExecError`] values.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::LlmClient;
use crate::errors::{classify_provider_error, ExecError};
use crate::model::ChatMessage;

pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> OpenAiCompatClient {
        OpenAiCompatClient {
            base_url: base_url.into(),
            api_key: api_key.into(),
            temperature: 0.0,
            max_tokens: 2048,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> OpenAiCompatClient {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let body = json!({
            "model": model,
            "messages": wire_messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let resp = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecError::Timeout(timeout)
                } else if e.is_connect() {
                    ExecError::Transport(e.to_string())
                } else {
                    classify_provider_error(e.to_string(), None)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_provider_error(
                format!("chat API error: {text}"),
                Some(status.as_u16()),
            ));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExecError::Transport(format!("malformed chat response: {e}")))?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ExecError::Transport("chat response missing content".into()))
    }

    fn provider_name(&self) -> &'static str {
        "openai-compat"
    }
}
