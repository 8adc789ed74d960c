//! Hierarchical summary tree.
//!
//! Keyed `model → prompt_type → tool_success_rate → difficulty →
//! task_type`, with the same aggregate shape at every level. Averages are
//! kept as `(sum, count)` so merging two independently built trees equals
//! observing the union — the property crash recovery leans on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::classifier::ErrorCategory;
use crate::model::{SuccessLevel, TestRecord};

/// Running mean kept in merge-friendly form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    pub sum: f64,
    pub count: u64,
}

impl RunningMean {
    pub fn push(&mut self, x: f64) {
        self.sum += x;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn merge(&mut self, other: &RunningMean) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Counts for the closed error-category set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub timeout_errors: u64,
    pub tool_call_format_errors: u64,
    pub max_turns_errors: u64,
    pub tool_selection_errors: u64,
    pub parameter_config_errors: u64,
    pub sequence_order_errors: u64,
    pub dependency_errors: u64,
    pub other_errors: u64,
}

impl ErrorCounts {
    pub fn increment(&mut self, category: ErrorCategory) {
        match category {
            ErrorCategory::TimeoutErrors => self.timeout_errors += 1,
            ErrorCategory::ToolCallFormatErrors => self.tool_call_format_errors += 1,
            ErrorCategory::MaxTurnsErrors => self.max_turns_errors += 1,
            ErrorCategory::ToolSelectionErrors => self.tool_selection_errors += 1,
            ErrorCategory::ParameterConfigErrors => self.parameter_config_errors += 1,
            ErrorCategory::SequenceOrderErrors => self.sequence_order_errors += 1,
            ErrorCategory::DependencyErrors => self.dependency_errors += 1,
            ErrorCategory::OtherErrors => self.other_errors += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.timeout_errors
            + self.tool_call_format_errors
            + self.max_turns_errors
            + self.tool_selection_errors
            + self.parameter_config_errors
            + self.sequence_order_errors
            + self.dependency_errors
            + self.other_errors
    }

    pub fn merge(&mut self, other: &ErrorCounts) {
        self.timeout_errors += other.timeout_errors;
        self.tool_call_format_errors += other.tool_call_format_errors;
        self.max_turns_errors += other.max_turns_errors;
        self.tool_selection_errors += other.tool_selection_errors;
        self.parameter_config_errors += other.parameter_config_errors;
        self.sequence_order_errors += other.sequence_order_errors;
        self.dependency_errors += other.dependency_errors;
        self.other_errors += other.other_errors;
    }
}

/// Aggregate shape shared by every node of the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafStats {
    pub total_tests: u64,
    pub full_success: u64,
    pub partial_success: u64,
    pub failure: u64,
    pub workflow_score: RunningMean,
    pub phase2_score: RunningMean,
    pub quality_score: RunningMean,
    pub final_score: RunningMean,
    pub execution_time: RunningMean,
    pub turns: RunningMean,
    pub tool_calls: RunningMean,
    pub tool_coverage: RunningMean,
    pub error_counts: ErrorCounts,
    pub assisted_success: u64,
    pub assisted_failure: u64,
}

impl LeafStats {
    pub fn observe(&mut self, record: &TestRecord) {
        self.total_tests += 1;
        match record.success_level {
            SuccessLevel::FullSuccess => self.full_success += 1,
            SuccessLevel::PartialSuccess => self.partial_success += 1,
            SuccessLevel::Failure => self.failure += 1,
        }
        self.workflow_score.push(record.workflow_score);
        self.phase2_score.push(record.phase2_score);
        self.quality_score.push(record.quality_score);
        self.final_score.push(record.final_score);
        self.execution_time.push(record.execution_time_seconds);
        self.turns.push(record.turns as f64);
        self.tool_calls.push(record.tool_calls.len() as f64);
        self.tool_coverage.push(record.tool_coverage_rate);

        // Every non-full-success record lands in exactly one bucket, so
        // the per-node sum of error counts equals total - full_success.
        if record.success_level != SuccessLevel::FullSuccess {
            self.error_counts
                .increment(record.ai_error_category.unwrap_or(ErrorCategory::OtherErrors));
        }

        if record.assisted {
            if record.success {
                self.assisted_success += 1;
            } else {
                self.assisted_failure += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &LeafStats) {
        self.total_tests += other.total_tests;
        self.full_success += other.full_success;
        self.partial_success += other.partial_success;
        self.failure += other.failure;
        self.workflow_score.merge(&other.workflow_score);
        self.phase2_score.merge(&other.phase2_score);
        self.quality_score.merge(&other.quality_score);
        self.final_score.merge(&other.final_score);
        self.execution_time.merge(&other.execution_time);
        self.turns.merge(&other.turns);
        self.tool_calls.merge(&other.tool_calls);
        self.tool_coverage.merge(&other.tool_coverage);
        self.error_counts.merge(&other.error_counts);
        self.assisted_success += other.assisted_success;
        self.assisted_failure += other.assisted_failure;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tests == 0 {
            0.0
        } else {
            (self.full_success + self.partial_success) as f64 / self.total_tests as f64
        }
    }

    /// Full successes weigh 1, partial 0.5.
    pub fn weighted_success_score(&self) -> f64 {
        if self.total_tests == 0 {
            0.0
        } else {
            (self.full_success as f64 + 0.5 * self.partial_success as f64)
                / self.total_tests as f64
        }
    }

    pub fn assisted_rate(&self) -> f64 {
        if self.total_tests == 0 {
            0.0
        } else {
            (self.assisted_success + self.assisted_failure) as f64 / self.total_tests as f64
        }
    }

    /// Node invariants: success buckets partition the total, error counts
    /// cover everything short of full success.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.full_success + self.partial_success + self.failure != self.total_tests {
            return Err(format!(
                "success buckets do not partition total: {} + {} + {} != {}",
                self.full_success, self.partial_success, self.failure, self.total_tests
            ));
        }
        if self.error_counts.total() != self.total_tests - self.full_success {
            return Err(format!(
                "error counts {} != total - full ({})",
                self.error_counts.total(),
                self.total_tests - self.full_success
            ));
        }
        Ok(())
    }

    /// Rendered view with the derived averages the document consumers read.
    pub fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "total_tests": self.total_tests,
            "full_success": self.full_success,
            "partial_success": self.partial_success,
            "failure": self.failure,
            "success_rate": self.success_rate(),
            "weighted_success_score": self.weighted_success_score(),
            "avg_workflow_score": self.workflow_score.mean(),
            "avg_phase2_score": self.phase2_score.mean(),
            "avg_quality_score": self.quality_score.mean(),
            "avg_final_score": self.final_score.mean(),
            "avg_execution_time": self.execution_time.mean(),
            "avg_turns": self.turns.mean(),
            "avg_tool_calls": self.tool_calls.mean(),
            "tool_coverage_rate": self.tool_coverage.mean(),
            "error_counts": serde_json::to_value(self.error_counts).unwrap_or_default(),
            "assisted_success": self.assisted_success,
            "assisted_failure": self.assisted_failure,
            "assisted_rate": self.assisted_rate(),
        })
    }
}

// ── Tree nodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifficultyNode {
    pub stats: LeafStats,
    pub by_task_type: BTreeMap<String, LeafStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateNode {
    pub stats: LeafStats,
    pub by_difficulty: BTreeMap<String, DifficultyNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptNode {
    pub stats: LeafStats,
    pub by_tool_success_rate: BTreeMap<String, RateNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelNode {
    pub overall: LeafStats,
    pub by_prompt_type: BTreeMap<String, PromptNode>,
}

/// The aggregated document. `row_high_water` records how far the row log
/// had advanced when this tree was last checkpointed; recovery replays
/// everything past it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryTree {
    pub models: BTreeMap<String, ModelNode>,
    pub total_records: u64,
    pub row_high_water: u64,
    #[serde(default)]
    pub last_updated: String,
}

/// Stable map key for a tool success rate.
pub fn rate_key(rate: f64) -> String {
    format!("{rate}")
}

impl SummaryTree {
    /// Route one record to its leaf and update every ancestor up to the
    /// model's `.overall`.
    pub fn observe(&mut self, record: &TestRecord) {
        self.total_records += 1;
        self.last_updated =
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let model = self.models.entry(record.model.clone()).or_default();
        model.overall.observe(record);

        let prompt = model
            .by_prompt_type
            .entry(record.prompt_type.to_string())
            .or_default();
        prompt.stats.observe(record);

        let rate = prompt
            .by_tool_success_rate
            .entry(rate_key(record.tool_success_rate))
            .or_default();
        rate.stats.observe(record);

        let difficulty = rate
            .by_difficulty
            .entry(record.difficulty.to_string())
            .or_default();
        difficulty.stats.observe(record);

        difficulty
            .by_task_type
            .entry(record.task_type.to_string())
            .or_default()
            .observe(record);
    }

    pub fn merge(&mut self, other: &SummaryTree) {
        self.total_records += other.total_records;
        self.row_high_water = self.row_high_water.max(other.row_high_water);
        if other.last_updated > self.last_updated {
            self.last_updated = other.last_updated.clone();
        }
        for (name, other_model) in &other.models {
            let model = self.models.entry(name.clone()).or_default();
            model.overall.merge(&other_model.overall);
            for (pt, other_prompt) in &other_model.by_prompt_type {
                let prompt = model.by_prompt_type.entry(pt.clone()).or_default();
                prompt.stats.merge(&other_prompt.stats);
                for (rk, other_rate) in &other_prompt.by_tool_success_rate {
                    let rate = prompt.by_tool_success_rate.entry(rk.clone()).or_default();
                    rate.stats.merge(&other_rate.stats);
                    for (dk, other_diff) in &other_rate.by_difficulty {
                        let diff = rate.by_difficulty.entry(dk.clone()).or_default();
                        diff.stats.merge(&other_diff.stats);
                        for (tk, other_leaf) in &other_diff.by_task_type {
                            diff.by_task_type
                                .entry(tk.clone())
                                .or_default()
                                .merge(other_leaf);
                        }
                    }
                }
            }
        }
    }

    pub fn remove_model(&mut self, model: &str) {
        if let Some(node) = self.models.remove(model) {
            self.total_records = self.total_records.saturating_sub(node.overall.total_tests);
        }
    }

    /// Check invariants on every node in the tree.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (name, model) in &self.models {
            model
                .overall
                .check_invariants()
                .map_err(|e| format!("{name}/overall: {e}"))?;
            for (pt, prompt) in &model.by_prompt_type {
                prompt
                    .stats
                    .check_invariants()
                    .map_err(|e| format!("{name}/{pt}: {e}"))?;
                for (rk, rate) in &prompt.by_tool_success_rate {
                    rate.stats
                        .check_invariants()
                        .map_err(|e| format!("{name}/{pt}/{rk}: {e}"))?;
                    for (dk, diff) in &rate.by_difficulty {
                        diff.stats
                            .check_invariants()
                            .map_err(|e| format!("{name}/{pt}/{rk}/{dk}: {e}"))?;
                        for (tk, leaf) in &diff.by_task_type {
                            leaf.check_invariants()
                                .map_err(|e| format!("{name}/{pt}/{rk}/{dk}/{tk}: {e}"))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Read-side filtering ─────────────────────────────────────────────────

/// Filter for `query_summary`. Unset fields keep the whole axis.
#[derive(Debug, Clone, Default)]
pub struct SummaryFilter {
    pub model: Option<String>,
    pub prompt_type: Option<String>,
    pub tool_success_rate: Option<f64>,
    pub difficulty: Option<String>,
    pub task_type: Option<String>,
}

/// Render the (filtered) tree with derived averages at every node.
pub fn render_query(tree: &SummaryTree, filter: &SummaryFilter) -> serde_json::Value {
    let mut models = serde_json::Map::new();
    for (name, model) in &tree.models {
        if filter.model.as_deref().is_some_and(|m| m != name) {
            continue;
        }
        let mut prompts = serde_json::Map::new();
        for (pt, prompt) in &model.by_prompt_type {
            if filter.prompt_type.as_deref().is_some_and(|p| p != pt) {
                continue;
            }
            let mut rates = serde_json::Map::new();
            for (rk, rate) in &prompt.by_tool_success_rate {
                if filter
                    .tool_success_rate
                    .is_some_and(|r| rate_key(r) != *rk)
                {
                    continue;
                }
                let mut difficulties = serde_json::Map::new();
                for (dk, diff) in &rate.by_difficulty {
                    if filter.difficulty.as_deref().is_some_and(|d| d != dk) {
                        continue;
                    }
                    let mut task_types = serde_json::Map::new();
                    for (tk, leaf) in &diff.by_task_type {
                        if filter.task_type.as_deref().is_some_and(|t| t != tk) {
                            continue;
                        }
                        task_types.insert(tk.clone(), leaf.render());
                    }
                    difficulties.insert(
                        dk.clone(),
                        serde_json::json!({
                            "stats": diff.stats.render(),
                            "by_task_type": task_types,
                        }),
                    );
                }
                rates.insert(
                    rk.clone(),
                    serde_json::json!({
                        "stats": rate.stats.render(),
                        "by_difficulty": difficulties,
                    }),
                );
            }
            prompts.insert(
                pt.clone(),
                serde_json::json!({
                    "stats": prompt.stats.render(),
                    "by_tool_success_rate": rates,
                }),
            );
        }
        models.insert(
            name.clone(),
            serde_json::json!({
                "overall": model.overall.render(),
                "by_prompt_type": prompts,
            }),
        );
    }
    serde_json::json!({
        "total_records": tree.total_records,
        "last_updated": tree.last_updated,
        "models": models,
    })
}
