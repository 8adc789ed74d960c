//! Interactive test executor.
//!
//! Runs one test: builds the prompt for the strategy, loops turns against
//! the LLM client, parses tool calls, simulates each call against the
//! registry with a per-call Bernoulli draw, and emits a `TestResult` with
//! the full transcript. Timeouts belong to the runner; between turns the
//! executor only observes the cooperative cancellation flag. The task's
//! soft timeout is passed through as the per-call chat deadline.

pub mod parser;
pub mod prompts;
pub mod scoring;

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{ErrorKind, ExecError};
use crate::model::{ChatMessage, ExecutionStep, SuccessLevel, TestResult, TestTask};
use crate::providers::llm::LlmClient;
use crate::tools::ToolRegistry;
use crate::transcript::{Transcript, TranscriptResult};
use crate::workflow::PreparedWorkflow;

use self::scoring::{EvaluationContext, ExecutionData, QualityScorer};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_turns: u32,
    /// When enabled (default), `final_score` is the Phase-2 score;
    /// otherwise the workflow score.
    pub phase2_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_turns: 10, phase2_enabled: true }
    }
}

pub struct Executor {
    client: Arc<dyn LlmClient>,
    scorer: Arc<dyn QualityScorer>,
    registry: Arc<ToolRegistry>,
    cfg: ExecutorConfig,
}

impl Executor {
    /// The scorer is required: Phase-2 scoring fails closed, so an
    /// executor without one cannot exist.
    pub fn new(
        client: Arc<dyn LlmClient>,
        scorer: Arc<dyn QualityScorer>,
        registry: Arc<ToolRegistry>,
    ) -> Executor {
        Executor { client, scorer, registry, cfg: ExecutorConfig::default() }
    }

    pub fn with_config(mut self, cfg: ExecutorConfig) -> Executor {
        self.cfg = cfg;
        self
    }

    /// Run one test to completion. Throttles propagate as errors so the
    /// runner can requeue without a record; every other outcome produces a
    /// `TestResult`.
    pub async fn run(
        &self,
        task: &TestTask,
        prepared: &PreparedWorkflow,
        cancelled: &AtomicBool,
    ) -> Result<TestResult, ExecError> {
        let ordinal = rand::thread_rng().gen_range(0..1000u32);
        let instance = task.task_instance.as_ref();
        let mut transcript = Transcript::begin(task, instance, ordinal);

        let prompt = prompts::render(task, instance, prepared, &self.registry);
        transcript.prompt = prompt.clone();

        let chat_deadline = Duration::from_secs(task.effective_timeout_seconds());
        let started = Instant::now();

        let mut messages = vec![ChatMessage::user(prompt, 1)];
        let mut tool_calls: Vec<String> = Vec::new();
        let mut executed_tools: Vec<String> = Vec::new();
        let mut steps: Vec<ExecutionStep> = Vec::new();
        let mut format_error_count = 0u32;
        let mut assisted = false;
        let mut error_message: Option<String> = None;
        let mut error_kind: Option<ErrorKind> = None;
        let mut turns = 0u32;

        'turns: for turn in 1..=self.cfg.max_turns {
            if cancelled.load(Ordering::Relaxed) {
                return Err(ExecError::Cancelled);
            }

            turns = turn;
            let response = match self
                .client
                .chat(&messages, task.api_model(), chat_deadline)
                .await
            {
                Ok(text) => text,
                Err(e) if e.is_throttle() => return Err(e),
                Err(e) => {
                    error_message = Some(e.to_string());
                    error_kind = Some(e.kind());
                    break 'turns;
                }
            };

            let assistant = ChatMessage::assistant(response.clone(), turn);
            messages.push(assistant.clone());
            transcript.push_message(assistant);

            let parsed = parser::extract_tool_calls(&response, &self.registry);
            let mut observations: Vec<String> = Vec::new();

            if parsed.format_error {
                format_error_count += 1;
                assisted = true;
                observations.push(
                    "No valid tool call could be parsed. Use exactly: \
                     TOOL_CALL: tool_name(param=\"value\")"
                        .to_string(),
                );
            }

            for call in &parsed.calls {
                tool_calls.push(call.clone());
                transcript.tool_calls.push(call.clone());
                let ok = rand::thread_rng().gen_bool(task.tool_success_rate.clamp(0.0, 1.0));
                let step = ExecutionStep {
                    turn,
                    tool: call.clone(),
                    success: ok,
                    error: (!ok).then(|| "simulated tool failure".to_string()),
                };
                if ok {
                    executed_tools.push(call.clone());
                    observations.push(format!("Tool {call} executed successfully."));
                } else {
                    observations.push(format!("Tool {call} failed: simulated tool failure."));
                }
                transcript.push_step(step.clone());
                steps.push(step);
            }

            if response.contains(prompts::COMPLETION_MARKER) {
                break 'turns;
            }

            if observations.is_empty() {
                observations.push("Continue with the task using TOOL_CALL lines.".to_string());
            }
            let observation = ChatMessage::user(observations.join("\n"), turn);
            messages.push(observation.clone());
            transcript.push_message(observation);
        }

        // Scores run against the unperturbed reference sequence even for
        // flawed prompts; that asymmetry is the measurement.
        let workflow_score =
            scoring::workflow_adherence(&executed_tools, &prepared.reference_sequence);
        let required = if task.required_tools.is_empty() {
            instance.map(|i| i.required_tools.clone()).unwrap_or_default()
        } else {
            task.required_tools.clone()
        };
        let tool_coverage_rate = scoring::tool_coverage(&executed_tools, &required);

        let execution = ExecutionData {
            tool_calls: &tool_calls,
            executed_tools: &executed_tools,
            steps: &steps,
            turns,
            format_error_count,
        };
        let ctx = EvaluationContext {
            task_type: task.task_type,
            required_tools: &required,
            reference_sequence: &prepared.reference_sequence,
        };
        let breakdown = self.scorer.score(&execution, &ctx)?;
        let phase2_score = breakdown.phase2_score.clamp(0.0, 1.0);
        let quality_score = breakdown.quality_score.clamp(0.0, 1.0);
        let final_score = if self.cfg.phase2_enabled { phase2_score } else { workflow_score };

        let mut success_level = SuccessLevel::from_scores(workflow_score, phase2_score);
        if error_message.is_some() {
            success_level = SuccessLevel::Failure;
        }

        let execution_time_seconds = started.elapsed().as_secs_f64();
        transcript.result = Some(TranscriptResult {
            success: success_level != SuccessLevel::Failure,
            success_level: success_level.to_string(),
            final_score,
            workflow_score,
            phase2_score,
            execution_time_seconds,
            format_error_count,
            error: error_message.clone(),
            error_kind: error_kind.map(|k| k.as_str().to_string()),
        });

        Ok(TestResult {
            success: success_level != SuccessLevel::Failure,
            success_level,
            execution_time_seconds,
            turns,
            tool_calls,
            executed_tools,
            workflow_score,
            phase2_score,
            quality_score,
            final_score,
            tool_coverage_rate,
            format_error_count,
            assisted,
            error_message,
            error_kind,
            transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PromptType, TaskType};
    use crate::providers::llm::ScriptedClient;
    use crate::workflow::Workflow;
    use super::scoring::FixedScorer;

    fn registry() -> Arc<ToolRegistry> {
        let mut r = ToolRegistry::new();
        for name in ["data_reader", "data_parser", "file_writer"] {
            r.ensure(name);
        }
        Arc::new(r)
    }

    fn prepared() -> PreparedWorkflow {
        let wf = Workflow {
            task_type: "data_pipeline".into(),
            optimal_sequence: vec![
                "data_reader".into(),
                "data_parser".into(),
                "file_writer".into(),
            ],
            required_tools: vec!["data_reader".into()],
            metadata: serde_json::Value::Null,
        };
        PreparedWorkflow { reference_sequence: wf.optimal_sequence.clone(), presented: wf }
    }

    fn task() -> TestTask {
        let mut t = TestTask::new("gpt-4o-mini", TaskType::DataPipeline, PromptType::Optimal);
        t.tool_success_rate = 1.0;
        t.required_tools = vec!["data_reader".into()];
        t
    }

    fn executor(replies: Vec<Result<String, ExecError>>) -> Executor {
        Executor::new(
            Arc::new(ScriptedClient::new(replies)),
            Arc::new(FixedScorer::perfect()),
            registry(),
        )
    }

    #[tokio::test]
    async fn clean_run_is_full_success() {
        let exec = executor(vec![
            Ok("TOOL_CALL: data_reader()\nTOOL_CALL: data_parser()".into()),
            Ok("TOOL_CALL: file_writer()\nTASK_COMPLETED".into()),
        ]);
        let result = exec
            .run(&task(), &prepared(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(result.success_level, SuccessLevel::FullSuccess);
        assert_eq!(result.turns, 2);
        assert_eq!(result.tool_calls.len(), 3);
        assert_eq!(result.executed_tools, result.tool_calls);
        assert_eq!(result.workflow_score, 1.0);
        assert_eq!(result.tool_coverage_rate, 1.0);
    }

    #[tokio::test]
    async fn executed_tools_shrink_when_simulation_fails() {
        let mut t = task();
        t.tool_success_rate = 0.0;
        let exec = executor(vec![Ok(
            "TOOL_CALL: data_reader()\nTASK_COMPLETED".into()
        )]);
        let result = exec.run(&t, &prepared(), &AtomicBool::new(false)).await.unwrap();
        assert_eq!(result.tool_calls, vec!["data_reader"]);
        assert!(result.executed_tools.is_empty());
        assert_eq!(result.workflow_score, 0.0);
    }

    #[tokio::test]
    async fn format_errors_are_counted_and_assisted() {
        let exec = executor(vec![
            Ok("TOOL_CALL: ???garbage".into()),
            Ok("TOOL_CALL: data_reader()\nTASK_COMPLETED".into()),
        ]);
        let result = exec
            .run(&task(), &prepared(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(result.format_error_count, 1);
        assert!(result.assisted);
    }

    #[tokio::test]
    async fn throttle_propagates_without_result() {
        let exec = executor(vec![Err(ExecError::Throttle("rate limit".into()))]);
        let err = exec
            .run(&task(), &prepared(), &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(err.is_throttle());
    }

    #[tokio::test]
    async fn transport_error_becomes_failure_result() {
        let exec = executor(vec![Err(ExecError::Transport("connection reset".into()))]);
        let result = exec
            .run(&task(), &prepared(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(result.success_level, SuccessLevel::Failure);
        assert_eq!(result.error_kind, Some(ErrorKind::Transport));
        assert!(result.error_message.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn turn_budget_is_enforced() {
        // Never completes, never calls tools.
        let exec = executor(vec![]).with_config(ExecutorConfig {
            max_turns: 3,
            phase2_enabled: true,
        });
        let client = Arc::new(ScriptedClient::new(vec![]).with_fallback("still thinking..."));
        let exec = Executor {
            client,
            scorer: Arc::new(FixedScorer { phase2_score: 0.0, quality_score: 0.0 }),
            registry: registry(),
            cfg: exec.cfg,
        };
        let result = exec
            .run(&task(), &prepared(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(result.turns, 3);
        assert_eq!(result.success_level, SuccessLevel::Failure);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_turns() {
        let exec = executor(vec![]);
        let cancelled = AtomicBool::new(true);
        let err = exec.run(&task(), &prepared(), &cancelled).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[tokio::test]
    async fn final_score_falls_back_to_workflow_when_phase2_disabled() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            "TOOL_CALL: data_reader()\nTASK_COMPLETED".into(),
        )]));
        let exec = Executor::new(
            client,
            Arc::new(FixedScorer { phase2_score: 0.2, quality_score: 0.2 }),
            registry(),
        )
        .with_config(ExecutorConfig { max_turns: 10, phase2_enabled: false });
        let result = exec
            .run(&task(), &prepared(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert!((result.final_score - result.workflow_score).abs() < 1e-9);
    }
}
