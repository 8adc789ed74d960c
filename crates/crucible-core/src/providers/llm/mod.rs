//! LLM transport contract.
//!
//! The harness assumes a single capability: send a chat completion, get
//! text or a classified error back. Provider selection happens via the
//! task's model id; everything else about the transport lives behind
//! [`LlmClient`].

pub mod http;

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::ExecError;
use crate::model::ChatMessage;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One chat completion. Errors must already be classified at the
    /// boundary: throttles as `ExecError::Throttle`, deadline misses as
    /// `ExecError::Timeout`, connectivity as `ExecError::Transport`.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        timeout: Duration,
    ) -> Result<String, ExecError>;

    fn provider_name(&self) -> &'static str {
        "custom"
    }
}

/// Scripted client: pops one canned reply per call. Used by tests and the
/// offline smoke path; behaves like an infinitely fast provider.
pub struct ScriptedClient {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<String, ExecError>>>,
    /// Reply used when the script runs out.
    fallback: String,
    pub delay: Duration,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<String, ExecError>>) -> ScriptedClient {
        ScriptedClient {
            replies: std::sync::Mutex::new(replies.into()),
            fallback: "TASK_COMPLETED".to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> ScriptedClient {
        self.fallback = fallback.into();
        self
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _model: &str,
        _timeout: Duration,
    ) -> Result<String, ExecError> {
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}
