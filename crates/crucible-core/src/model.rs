//! Closed product types for the evaluation pipeline.
//!
//! Everything that crosses a component boundary (planner → runner →
//! executor → store) is one of these types. Optional fields are `Option`;
//! nothing is attached dynamically.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classifier::ErrorCategory;
use crate::errors::ErrorKind;
use crate::transcript::Transcript;

/// Default soft per-task timeout (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Hard ceiling a task may never exceed, regardless of configuration.
pub const MAX_TIMEOUT_SECS: u64 = 900;

// ── Task axes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SimpleTask,
    BasicTask,
    DataPipeline,
    ApiIntegration,
    MultiStagePipeline,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::SimpleTask,
        TaskType::BasicTask,
        TaskType::DataPipeline,
        TaskType::ApiIntegration,
        TaskType::MultiStagePipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SimpleTask => "simple_task",
            TaskType::BasicTask => "basic_task",
            TaskType::DataPipeline => "data_pipeline",
            TaskType::ApiIntegration => "api_integration",
            TaskType::MultiStagePipeline => "multi_stage_pipeline",
        }
    }

    pub fn parse(s: &str) -> Option<TaskType> {
        TaskType::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    VeryEasy,
    Easy,
    Medium,
    Hard,
    VeryHard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 5] = [
        Difficulty::VeryEasy,
        Difficulty::Easy,
        Difficulty::Medium,
        Difficulty::Hard,
        Difficulty::VeryHard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::VeryEasy => "very_easy",
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::VeryHard => "very_hard",
        }
    }

    pub fn parse(s: &str) -> Option<Difficulty> {
        Difficulty::ALL.iter().copied().find(|d| d.as_str() == s)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlawType {
    SequenceDisorder,
    ToolMisuse,
    ParameterError,
    MissingStep,
    RedundantOperations,
    LogicalInconsistency,
    SemanticDrift,
}

impl FlawType {
    pub const ALL: [FlawType; 7] = [
        FlawType::SequenceDisorder,
        FlawType::ToolMisuse,
        FlawType::ParameterError,
        FlawType::MissingStep,
        FlawType::RedundantOperations,
        FlawType::LogicalInconsistency,
        FlawType::SemanticDrift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlawType::SequenceDisorder => "sequence_disorder",
            FlawType::ToolMisuse => "tool_misuse",
            FlawType::ParameterError => "parameter_error",
            FlawType::MissingStep => "missing_step",
            FlawType::RedundantOperations => "redundant_operations",
            FlawType::LogicalInconsistency => "logical_inconsistency",
            FlawType::SemanticDrift => "semantic_drift",
        }
    }

    pub fn parse(s: &str) -> Option<FlawType> {
        FlawType::ALL.iter().copied().find(|f| f.as_str() == s)
    }
}

impl fmt::Display for FlawType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt strategy. Flawed strategies carry the flaw injected into the
/// workflow before it is presented to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PromptType {
    Baseline,
    Optimal,
    Cot,
    Flawed(FlawType),
}

impl PromptType {
    /// The ten canonical strategies: three base plus one per flaw.
    pub fn canonical() -> Vec<PromptType> {
        let mut all = vec![PromptType::Baseline, PromptType::Optimal, PromptType::Cot];
        all.extend(FlawType::ALL.iter().map(|f| PromptType::Flawed(*f)));
        all
    }

    pub fn is_flawed(&self) -> bool {
        matches!(self, PromptType::Flawed(_))
    }

    pub fn flaw_type(&self) -> Option<FlawType> {
        match self {
            PromptType::Flawed(f) => Some(*f),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<PromptType> {
        match s {
            "baseline" => Some(PromptType::Baseline),
            "optimal" => Some(PromptType::Optimal),
            "cot" => Some(PromptType::Cot),
            other => other
                .strip_prefix("flawed_")
                .and_then(FlawType::parse)
                .map(PromptType::Flawed),
        }
    }
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptType::Baseline => f.write_str("baseline"),
            PromptType::Optimal => f.write_str("optimal"),
            PromptType::Cot => f.write_str("cot"),
            PromptType::Flawed(flaw) => write!(f, "flawed_{}", flaw.as_str()),
        }
    }
}

impl Serialize for PromptType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PromptType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PromptType::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown prompt type: {s}")))
    }
}

// ── Task instances ───────────────────────────────────────────────────────

/// One concrete task drawn from the task library. `workflow` is present
/// when the library ships pregenerated workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub expected_outputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<crate::workflow::Workflow>,
}

/// One planned test. Immutable after planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTask {
    pub model: String,
    /// Deployment instance used for the API call; `model` is the name used
    /// for statistics. Falls back to `model` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    pub task_type: TaskType,
    pub prompt_type: PromptType,
    pub difficulty: Difficulty,
    /// Per-call Bernoulli parameter of the simulated tool layer.
    pub tool_success_rate: f64,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_instance: Option<TaskInstance>,
}

impl TestTask {
    pub fn new(model: impl Into<String>, task_type: TaskType, prompt_type: PromptType) -> Self {
        Self {
            model: model.into(),
            deployment: None,
            task_type,
            prompt_type,
            difficulty: Difficulty::Easy,
            tool_success_rate: 0.8,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            required_tools: Vec::new(),
            task_instance: None,
        }
    }

    pub fn is_flawed(&self) -> bool {
        self.prompt_type.is_flawed()
    }

    pub fn flaw_type(&self) -> Option<FlawType> {
        self.prompt_type.flaw_type()
    }

    /// Model name to use on the wire.
    pub fn api_model(&self) -> &str {
        self.deployment.as_deref().unwrap_or(&self.model)
    }

    /// Soft timeout, clamped to the hard ceiling.
    pub fn effective_timeout_seconds(&self) -> u64 {
        self.timeout_seconds.clamp(1, MAX_TIMEOUT_SECS)
    }
}

// ── Results ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessLevel {
    FullSuccess,
    PartialSuccess,
    Failure,
}

impl SuccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuccessLevel::FullSuccess => "full_success",
            SuccessLevel::PartialSuccess => "partial_success",
            SuccessLevel::Failure => "failure",
        }
    }

    /// Full needs both scores >= 0.8; partial needs at least one >= 0.5.
    pub fn from_scores(workflow_score: f64, phase2_score: f64) -> SuccessLevel {
        if workflow_score >= 0.8 && phase2_score >= 0.8 {
            SuccessLevel::FullSuccess
        } else if workflow_score >= 0.5 || phase2_score >= 0.5 {
            SuccessLevel::PartialSuccess
        } else {
            SuccessLevel::Failure
        }
    }
}

impl fmt::Display for SuccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one executed test, produced by a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub success_level: SuccessLevel,
    pub execution_time_seconds: f64,
    pub turns: u32,
    pub tool_calls: Vec<String>,
    /// Successfully executed calls only; always a multiset subset of
    /// `tool_calls`.
    pub executed_tools: Vec<String>,
    pub workflow_score: f64,
    pub phase2_score: f64,
    pub quality_score: f64,
    pub final_score: f64,
    pub tool_coverage_rate: f64,
    pub format_error_count: u32,
    /// Set when at least one turn needed a format reminder.
    pub assisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Boundary classification of the failure, used as a classifier hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub transcript: Transcript,
}

/// Persisted row: task keys + result + classifier outputs + timestamp.
/// The transcript is not part of the record; it is persisted separately
/// when log saving is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    pub task_type: TaskType,
    pub prompt_type: PromptType,
    pub difficulty: Difficulty,
    pub is_flawed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flaw_type: Option<FlawType>,
    pub tool_success_rate: f64,
    pub success: bool,
    pub success_level: SuccessLevel,
    pub execution_time_seconds: f64,
    pub turns: u32,
    pub tool_calls: Vec<String>,
    pub executed_tools: Vec<String>,
    pub workflow_score: f64,
    pub phase2_score: f64,
    pub quality_score: f64,
    pub final_score: f64,
    pub tool_coverage_rate: f64,
    pub format_error_count: u32,
    pub assisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_confidence: Option<f64>,
    pub timestamp: String,
}

impl TestRecord {
    /// Assemble a record from the task/result pair. Classifier fields start
    /// empty and are filled by the runner when classification ran.
    pub fn from_parts(task: &TestTask, result: &TestResult) -> TestRecord {
        TestRecord {
            model: task.model.clone(),
            deployment: task.deployment.clone(),
            task_type: task.task_type,
            prompt_type: task.prompt_type,
            difficulty: task.difficulty,
            is_flawed: task.is_flawed(),
            flaw_type: task.flaw_type(),
            tool_success_rate: task.tool_success_rate,
            success: result.success,
            success_level: result.success_level,
            execution_time_seconds: result.execution_time_seconds,
            turns: result.turns,
            tool_calls: result.tool_calls.clone(),
            executed_tools: result.executed_tools.clone(),
            workflow_score: result.workflow_score,
            phase2_score: result.phase2_score,
            quality_score: result.quality_score,
            final_score: result.final_score,
            tool_coverage_rate: result.tool_coverage_rate,
            format_error_count: result.format_error_count,
            assisted: result.assisted,
            error_message: result.error_message.clone(),
            error_kind: result.error_kind,
            ai_error_category: None,
            ai_error_reason: None,
            ai_confidence: None,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

// ── Chat messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in the interactive conversation, tagged with its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub turn: u32,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, turn: u32) -> Self {
        Self { role: Role::User, content: content.into(), turn }
    }

    pub fn assistant(content: impl Into<String>, turn: u32) -> Self {
        Self { role: Role::Assistant, content: content.into(), turn }
    }
}

/// One simulated tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub turn: u32,
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_type_round_trips_through_strings() {
        for pt in PromptType::canonical() {
            let s = pt.to_string();
            assert_eq!(PromptType::parse(&s), Some(pt), "{s}");
        }
        assert_eq!(PromptType::parse("flawed_nonsense"), None);
    }

    #[test]
    fn canonical_prompt_strategies_count_ten() {
        assert_eq!(PromptType::canonical().len(), 10);
    }

    #[test]
    fn success_level_thresholds() {
        assert_eq!(SuccessLevel::from_scores(0.8, 0.8), SuccessLevel::FullSuccess);
        assert_eq!(SuccessLevel::from_scores(0.9, 0.5), SuccessLevel::PartialSuccess);
        assert_eq!(SuccessLevel::from_scores(0.4, 0.79), SuccessLevel::PartialSuccess);
        assert_eq!(SuccessLevel::from_scores(0.49, 0.49), SuccessLevel::Failure);
    }

    #[test]
    fn timeout_is_clamped_to_hard_ceiling() {
        let mut task = TestTask::new("gpt-4o-mini", TaskType::SimpleTask, PromptType::Baseline);
        assert_eq!(task.effective_timeout_seconds(), DEFAULT_TIMEOUT_SECS);
        task.timeout_seconds = 10_000;
        assert_eq!(task.effective_timeout_seconds(), MAX_TIMEOUT_SECS);
    }

    #[test]
    fn record_carries_task_keys_and_flaw_fields() {
        let mut task = TestTask::new(
            "deepseek-v3",
            TaskType::DataPipeline,
            PromptType::Flawed(FlawType::MissingStep),
        );
        task.deployment = Some("deepseek-v3-0324".into());
        let result = dummy_result();
        let record = TestRecord::from_parts(&task, &result);
        assert!(record.is_flawed);
        assert_eq!(record.flaw_type, Some(FlawType::MissingStep));
        assert_eq!(record.deployment.as_deref(), Some("deepseek-v3-0324"));
        assert!(record.ai_error_category.is_none());
    }

    fn dummy_result() -> TestResult {
        TestResult {
            success: false,
            success_level: SuccessLevel::Failure,
            execution_time_seconds: 1.0,
            turns: 2,
            tool_calls: vec!["data_reader".into()],
            executed_tools: vec![],
            workflow_score: 0.0,
            phase2_score: 0.0,
            quality_score: 0.0,
            final_score: 0.0,
            tool_coverage_rate: 0.0,
            format_error_count: 0,
            assisted: false,
            error_message: None,
            error_kind: None,
            transcript: Transcript::default(),
        }
    }
}
