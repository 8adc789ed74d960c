//! Error classification for non-full-success tests.
//!
//! The category set is closed: every error count in the store uses exactly
//! these eight labels. The canonical implementation asks a small LLM to
//! reason over the full transcript; the rule-based fallback only trusts
//! structured evidence (the boundary hint and the transcript's Results /
//! Execution sections), never keyword hits inside conversation content —
//! a model saying the word "timeout" mid-chat is not a timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::providers::llm::LlmClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TimeoutErrors,
    ToolCallFormatErrors,
    MaxTurnsErrors,
    ToolSelectionErrors,
    ParameterConfigErrors,
    SequenceOrderErrors,
    DependencyErrors,
    OtherErrors,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::TimeoutErrors,
        ErrorCategory::ToolCallFormatErrors,
        ErrorCategory::MaxTurnsErrors,
        ErrorCategory::ToolSelectionErrors,
        ErrorCategory::ParameterConfigErrors,
        ErrorCategory::SequenceOrderErrors,
        ErrorCategory::DependencyErrors,
        ErrorCategory::OtherErrors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TimeoutErrors => "timeout_errors",
            ErrorCategory::ToolCallFormatErrors => "tool_call_format_errors",
            ErrorCategory::MaxTurnsErrors => "max_turns_errors",
            ErrorCategory::ToolSelectionErrors => "tool_selection_errors",
            ErrorCategory::ParameterConfigErrors => "parameter_config_errors",
            ErrorCategory::SequenceOrderErrors => "sequence_order_errors",
            ErrorCategory::DependencyErrors => "dependency_errors",
            ErrorCategory::OtherErrors => "other_errors",
        }
    }

    pub fn parse(s: &str) -> Option<ErrorCategory> {
        ErrorCategory::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub reason: String,
    pub confidence: f64,
}

impl Classification {
    pub fn unavailable() -> Classification {
        Classification {
            category: ErrorCategory::OtherErrors,
            reason: "classifier unavailable".into(),
            confidence: 0.0,
        }
    }
}

/// Pluggable classifier. Implementations never fail: degraded output is
/// `other_errors` with zero confidence.
#[async_trait]
pub trait ErrorClassifier: Send + Sync {
    async fn classify(&self, transcript_text: &str, hint: Option<ErrorKind>) -> Classification;
}

// ── Rule-based fallback ─────────────────────────────────────────────────

/// Classifier of last resort. Only structured evidence is admissible: the
/// boundary error kind and the machine-written transcript sections.
#[derive(Debug, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    fn from_hint(hint: ErrorKind) -> Option<Classification> {
        let (category, reason, confidence) = match hint {
            ErrorKind::Timeout => (
                ErrorCategory::TimeoutErrors,
                "harness aborted the test for time",
                0.9,
            ),
            ErrorKind::Transport => (
                ErrorCategory::OtherErrors,
                "transport failure before the model could finish",
                0.6,
            ),
            ErrorKind::NoWorkflow => (
                ErrorCategory::OtherErrors,
                "no workflow was available for the task",
                0.8,
            ),
            ErrorKind::Throttle | ErrorKind::Other => return None,
        };
        Some(Classification { category, reason: reason.into(), confidence })
    }
}

/// Pull `key: value` out of the transcript's Results block.
fn results_field<'a>(transcript: &'a str, key: &str) -> Option<&'a str> {
    let results = transcript.split("Results:").nth(1)?;
    results
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))
        .map(|rest| rest.trim_start_matches(':').trim())
}

fn turn_count(transcript: &str) -> u32 {
    let Some(history) = transcript.split("Conversation History:").nth(1) else {
        return 0;
    };
    let history = history.split("Extracted Tool Calls:").next().unwrap_or(history);
    history
        .lines()
        .filter(|l| l.starts_with("Turn ") && l.trim_end().ends_with(':'))
        .count() as u32
}

fn extracted_calls_empty(transcript: &str) -> bool {
    transcript
        .split("Extracted Tool Calls:")
        .nth(1)
        .and_then(|s| s.lines().find(|l| l.trim().starts_with('[')))
        .map(|l| l.trim() == "[]")
        .unwrap_or(false)
}

#[async_trait]
impl ErrorClassifier for RuleClassifier {
    async fn classify(&self, transcript_text: &str, hint: Option<ErrorKind>) -> Classification {
        if let Some(c) = hint.and_then(RuleClassifier::from_hint) {
            return c;
        }

        let format_errors: u32 = results_field(transcript_text, "Format Errors")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let no_calls = extracted_calls_empty(transcript_text);
        let turns = turn_count(transcript_text);

        if no_calls && format_errors > 0 {
            return Classification {
                category: ErrorCategory::ToolCallFormatErrors,
                reason: format!(
                    "{format_errors} responses carried the call marker but none parsed"
                ),
                confidence: 0.8,
            };
        }
        if no_calls && turns >= 10 {
            return Classification {
                category: ErrorCategory::MaxTurnsErrors,
                reason: "turn budget exhausted without a single tool call".into(),
                confidence: 0.7,
            };
        }
        if format_errors > 0 {
            return Classification {
                category: ErrorCategory::ToolCallFormatErrors,
                reason: format!("{format_errors} turns failed tool-call parsing"),
                confidence: 0.55,
            };
        }
        Classification {
            category: ErrorCategory::OtherErrors,
            reason: "no structural evidence matched a specific category".into(),
            confidence: 0.3,
        }
    }
}

// ── LLM-backed classifier ───────────────────────────────────────────────

/// Canonical implementation: feeds the transcript to a small model
/// constrained to the closed set and parses its structured reply. Any
/// failure along the way degrades to `other_errors` / 0.0 — this path
/// never throws.
pub struct LlmErrorClassifier {
    client: Arc<dyn LlmClient>,
    model: String,
    timeout: Duration,
}

impl LlmErrorClassifier {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> LlmErrorClassifier {
        LlmErrorClassifier { client, model: model.into(), timeout: Duration::from_secs(60) }
    }

    fn build_prompt(transcript_text: &str, hint: Option<ErrorKind>) -> String {
        let categories = ErrorCategory::ALL
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        let hint_line = hint
            .map(|h| format!("Boundary hint from the harness: {}.\n", h.as_str()))
            .unwrap_or_default();
        format!(
            "You are analyzing the transcript of a failed tool-use test. \
             Decide which single error category best explains the outcome.\n\n\
             Categories (choose exactly one):\n{categories}\n\n\
             {hint_line}\
             Reason over the whole transcript: where the conversation stalled, \
             which tools were called versus required, and in what order. Do not \
             pick a category because a word appears in conversation text.\n\n\
             Reply with one JSON object and nothing else:\n\
             {{\"category\": \"<one of the labels>\", \"reason\": \"<one sentence>\", \
             \"confidence\": <0.0-1.0>}}\n\n\
             Transcript:\n{transcript_text}"
        )
    }

    fn parse_reply(reply: &str) -> Option<Classification> {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        let value: serde_json::Value = serde_json::from_str(&reply[start..=end]).ok()?;
        let category = ErrorCategory::parse(value.get("category")?.as_str()?)?;
        let reason = value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let confidence = value
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        Some(Classification { category, reason, confidence })
    }
}

#[async_trait]
impl ErrorClassifier for LlmErrorClassifier {
    async fn classify(&self, transcript_text: &str, hint: Option<ErrorKind>) -> Classification {
        let prompt = Self::build_prompt(transcript_text, hint);
        let messages = vec![crate::model::ChatMessage::user(prompt, 1)];
        match self.client.chat(&messages, &self.model, self.timeout).await {
            Ok(reply) => match Self::parse_reply(&reply) {
                Some(c) => c,
                None => {
                    tracing::warn!("classifier reply did not parse; degrading to other_errors");
                    Classification::unavailable()
                }
            },
            Err(e) => {
                tracing::warn!("classifier call failed: {e}; degrading to other_errors");
                Classification::unavailable()
            }
        }
    }
}
