//! Score computation for executed tests.
//!
//! `workflow_score` is computed in-core against the unperturbed reference
//! sequence. The Phase-2 quality score comes from a [`QualityScorer`]; a
//! missing scorer is an initialization error, never a substituted zero.

use std::collections::BTreeSet;

use crate::errors::ExecError;
use crate::model::{ExecutionStep, TaskType};
use crate::tools::ToolCategory;

/// Adherence of executed tools to the reference sequence: set coverage of
/// the reference. An empty reference scores 1.0.
pub fn workflow_adherence(executed: &[String], reference: &[String]) -> f64 {
    if reference.is_empty() {
        return 1.0;
    }
    let reference_set: BTreeSet<&str> = reference.iter().map(String::as_str).collect();
    let executed_set: BTreeSet<&str> = executed.iter().map(String::as_str).collect();
    let hit = reference_set.intersection(&executed_set).count();
    hit as f64 / reference_set.len() as f64
}

/// `|executed ∩ required| / |required|`, 1.0 when nothing is required.
pub fn tool_coverage(executed: &[String], required: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let required_set: BTreeSet<&str> = required.iter().map(String::as_str).collect();
    let executed_set: BTreeSet<&str> = executed.iter().map(String::as_str).collect();
    let hit = required_set.intersection(&executed_set).count();
    hit as f64 / required_set.len() as f64
}

/// Execution trace handed to the Phase-2 scorer.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionData<'a> {
    pub tool_calls: &'a [String],
    pub executed_tools: &'a [String],
    pub steps: &'a [ExecutionStep],
    pub turns: u32,
    pub format_error_count: u32,
}

/// Evaluation context handed to the Phase-2 scorer.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub task_type: TaskType,
    pub required_tools: &'a [String],
    pub reference_sequence: &'a [String],
}

#[derive(Debug, Clone, Copy)]
pub struct QualityBreakdown {
    pub phase2_score: f64,
    pub quality_score: f64,
}

/// External Phase-2 scorer contract. Implementations must stay in [0, 1]
/// on both scores.
pub trait QualityScorer: Send + Sync {
    fn score(
        &self,
        execution: &ExecutionData<'_>,
        ctx: &EvaluationContext<'_>,
    ) -> Result<QualityBreakdown, ExecError>;
}

/// Default heuristic scorer: completion against the expected tool count
/// for the task type, operation coverage across input/process/output
/// families, and the fraction of simulated calls that succeeded. Quality
/// is tool diversity.
#[derive(Debug, Default)]
pub struct RubricScorer;

fn expected_tool_count(task_type: TaskType) -> usize {
    match task_type {
        TaskType::SimpleTask | TaskType::BasicTask => 2,
        TaskType::ApiIntegration => 3,
        TaskType::DataPipeline => 4,
        TaskType::MultiStagePipeline => 5,
    }
}

impl QualityScorer for RubricScorer {
    fn score(
        &self,
        execution: &ExecutionData<'_>,
        ctx: &EvaluationContext<'_>,
    ) -> Result<QualityBreakdown, ExecError> {
        let executed = execution.executed_tools;
        let expected = expected_tool_count(ctx.task_type) as f64;
        let task_completion = (executed.len() as f64 / expected).min(1.0);

        let has = |cat: ToolCategory| executed.iter().any(|t| ToolCategory::infer(t) == cat);
        let families = [
            has(ToolCategory::Input),
            has(ToolCategory::Transform) || has(ToolCategory::Computation),
            has(ToolCategory::Output),
        ];
        let operation_coverage =
            families.iter().filter(|present| **present).count() as f64 / families.len() as f64;

        let call_success = if execution.steps.is_empty() {
            0.0
        } else {
            execution.steps.iter().filter(|s| s.success).count() as f64
                / execution.steps.len() as f64
        };

        let phase2_score = 0.5 * task_completion + 0.3 * operation_coverage + 0.2 * call_success;

        let quality_score = if executed.is_empty() {
            0.0
        } else {
            let unique: BTreeSet<&str> = executed.iter().map(String::as_str).collect();
            unique.len() as f64 / executed.len() as f64
        };

        Ok(QualityBreakdown { phase2_score, quality_score })
    }
}

/// Scorer returning fixed values; used by the scenario tests to pin
/// success levels.
#[derive(Debug, Clone, Copy)]
pub struct FixedScorer {
    pub phase2_score: f64,
    pub quality_score: f64,
}

impl FixedScorer {
    pub fn perfect() -> FixedScorer {
        FixedScorer { phase2_score: 1.0, quality_score: 1.0 }
    }
}

impl QualityScorer for FixedScorer {
    fn score(
        &self,
        _execution: &ExecutionData<'_>,
        _ctx: &EvaluationContext<'_>,
    ) -> Result<QualityBreakdown, ExecError> {
        Ok(QualityBreakdown {
            phase2_score: self.phase2_score,
            quality_score: self.quality_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn adherence_is_set_coverage_of_reference() {
        let reference = owned(&["data_reader", "data_parser", "file_writer"]);
        assert_eq!(workflow_adherence(&owned(&["data_reader"]), &reference), 1.0 / 3.0);
        assert_eq!(workflow_adherence(&reference, &reference), 1.0);
        assert_eq!(workflow_adherence(&[], &reference), 0.0);
    }

    #[test]
    fn empty_reference_scores_full() {
        assert_eq!(workflow_adherence(&owned(&["anything"]), &[]), 1.0);
    }

    #[test]
    fn missing_step_drops_coverage_by_one_over_len() {
        // Executing the flawed four-step plan against the five-step
        // reference loses exactly one fifth.
        let reference = owned(&["r", "p", "t", "v", "w"]);
        let executed = owned(&["r", "p", "v", "w"]);
        let score = workflow_adherence(&executed, &reference);
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn coverage_defaults_to_full_when_nothing_required() {
        assert_eq!(tool_coverage(&[], &[]), 1.0);
        assert_eq!(tool_coverage(&owned(&["a"]), &owned(&["a", "b"])), 0.5);
    }

    #[test]
    fn rubric_scorer_rewards_complete_diverse_runs() {
        let executed = owned(&["data_reader", "data_parser", "data_transformer", "file_writer"]);
        let steps: Vec<ExecutionStep> = executed
            .iter()
            .map(|t| ExecutionStep { turn: 1, tool: t.clone(), success: true, error: None })
            .collect();
        let execution = ExecutionData {
            tool_calls: &executed,
            executed_tools: &executed,
            steps: &steps,
            turns: 2,
            format_error_count: 0,
        };
        let ctx = EvaluationContext {
            task_type: TaskType::DataPipeline,
            required_tools: &[],
            reference_sequence: &[],
        };
        let breakdown = RubricScorer.score(&execution, &ctx).unwrap();
        assert!((breakdown.phase2_score - 1.0).abs() < 1e-9);
        assert_eq!(breakdown.quality_score, 1.0);
    }

    #[test]
    fn rubric_scorer_zeroes_empty_runs() {
        let execution = ExecutionData {
            tool_calls: &[],
            executed_tools: &[],
            steps: &[],
            turns: 10,
            format_error_count: 3,
        };
        let ctx = EvaluationContext {
            task_type: TaskType::SimpleTask,
            required_tools: &[],
            reference_sequence: &[],
        };
        let breakdown = RubricScorer.score(&execution, &ctx).unwrap();
        assert_eq!(breakdown.phase2_score, 0.0);
        assert_eq!(breakdown.quality_score, 0.0);
    }
}
