//! Typed error surface for the harness.
//!
//! Errors drive control flow as values: throttles are recovered locally by
//! the runner, timeouts become failure records, everything else terminates
//! exactly one test. Logging never replaces propagation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Coarse kind attached to failure records and passed to the classifier
/// as a hint. Boundary-level, not the classifier's closed category set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Throttle,
    Timeout,
    Transport,
    NoWorkflow,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Throttle => "throttle",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::NoWorkflow => "no_workflow",
            ErrorKind::Other => "other",
        }
    }
}

/// Error produced while executing one test.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Upstream signaled a rate limit. Never terminal: the runner requeues
    /// the task and no record is written.
    #[error("provider throttled: {0}")]
    Throttle(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("workflow unavailable: {0}")]
    NoWorkflow(String),
    /// Cooperative cancellation observed between turns.
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Throttle(_) => ErrorKind::Throttle,
            ExecError::Timeout(_) => ErrorKind::Timeout,
            ExecError::Transport(_) => ErrorKind::Transport,
            ExecError::NoWorkflow(_) => ErrorKind::NoWorkflow,
            ExecError::Cancelled | ExecError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, ExecError::Throttle(_))
    }
}

/// True when a provider error message matches the throttle vocabulary:
/// "rate limit", HTTP 429, or the TPM/RPM phrasing some gateways use.
/// This runs at the transport boundary where the text is an error string,
/// not conversation content.
pub fn is_throttle_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("tpm")
        || lower.contains("rpm")
}

/// Classify a raw provider failure into an [`ExecError`]. Used by LLM
/// transports when they cannot produce a structured error themselves.
pub fn classify_provider_error(msg: impl Into<String>, status: Option<u16>) -> ExecError {
    let msg = msg.into();
    if status == Some(429) || is_throttle_message(&msg) {
        return ExecError::Throttle(msg);
    }
    let lower = msg.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        return ExecError::Timeout(Duration::ZERO);
    }
    if lower.contains("connection")
        || lower.contains("dns")
        || lower.contains("network")
        || status.map_or(false, |s| s >= 500)
    {
        return ExecError::Transport(msg);
    }
    ExecError::Other(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_vocabulary_matches() {
        assert!(is_throttle_message("Rate limit exceeded, retry later"));
        assert!(is_throttle_message("HTTP 429 from upstream"));
        assert!(is_throttle_message("TPM/RPM quota hit"));
        assert!(!is_throttle_message("connection reset by peer"));
    }

    #[test]
    fn classify_maps_status_and_messages() {
        assert!(classify_provider_error("anything", Some(429)).is_throttle());
        assert!(matches!(
            classify_provider_error("request timed out", None),
            ExecError::Timeout(_)
        ));
        assert!(matches!(
            classify_provider_error("bad gateway", Some(502)),
            ExecError::Transport(_)
        ));
        assert!(matches!(
            classify_provider_error("unexpected EOF in body", None),
            ExecError::Other(_)
        ));
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ExecError::Throttle("x".into()).kind(), ErrorKind::Throttle);
        assert_eq!(
            ExecError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ExecError::Cancelled.kind(), ErrorKind::Other);
    }
}
