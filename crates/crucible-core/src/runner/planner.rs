//! Batch planner: the Cartesian product of test cells.
//!
//! `models × prompt strategies × task types × per-cell count` at one
//! difficulty, instances drawn round-robin from the task library, then a
//! seeded shuffle so provider load spreads across cells.

use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model::{Difficulty, PromptType, TaskType, TestTask, DEFAULT_TIMEOUT_SECS};
use crate::workflow::TaskLibrary;

#[derive(Debug, Clone)]
pub struct PlanSpec {
    pub models: Vec<String>,
    /// Strategy names; `["all"]` expands to the ten canonical strategies.
    pub prompt_types: Vec<String>,
    /// Task type names; `["all"]` expands to every type.
    pub task_types: Vec<String>,
    pub difficulty: Difficulty,
    pub per_cell: u32,
    pub tool_success_rate: f64,
    pub timeout_seconds: u64,
    /// Shuffle seed; a fixed seed reproduces the exact batch order.
    pub seed: Option<u64>,
}

impl Default for PlanSpec {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            prompt_types: vec!["all".into()],
            task_types: vec!["all".into()],
            difficulty: Difficulty::Easy,
            per_cell: 1,
            tool_success_rate: 0.8,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            seed: None,
        }
    }
}

fn expand_prompt_types(names: &[String]) -> anyhow::Result<Vec<PromptType>> {
    if names.iter().any(|n| n == "all") {
        return Ok(PromptType::canonical());
    }
    names
        .iter()
        .map(|n| {
            PromptType::parse(n).ok_or_else(|| anyhow::anyhow!("unknown prompt type: {n}"))
        })
        .collect()
}

fn expand_task_types(names: &[String]) -> anyhow::Result<Vec<TaskType>> {
    if names.iter().any(|n| n == "all") {
        return Ok(TaskType::ALL.to_vec());
    }
    names
        .iter()
        .map(|n| TaskType::parse(n).ok_or_else(|| anyhow::anyhow!("unknown task type: {n}")))
        .collect()
}

/// Enumerate the plan. Cells whose task type has no instances in the
/// library are skipped with a warning rather than failing the batch.
pub fn plan(spec: &PlanSpec, library: &dyn TaskLibrary) -> anyhow::Result<Vec<TestTask>> {
    let prompt_types = expand_prompt_types(&spec.prompt_types)?;
    let task_types = expand_task_types(&spec.task_types)?;
    anyhow::ensure!(!spec.models.is_empty(), "plan needs at least one model");
    anyhow::ensure!(spec.per_cell > 0, "per-cell count must be positive");

    let mut tasks = Vec::new();
    for model in &spec.models {
        for task_type in &task_types {
            let instances = library.instances(spec.difficulty, *task_type);
            if instances.is_empty() {
                tracing::warn!(
                    task_type = %task_type,
                    difficulty = %spec.difficulty,
                    "no instances in library, skipping cell"
                );
                continue;
            }
            for prompt_type in &prompt_types {
                for i in 0..spec.per_cell {
                    let instance = instances[i as usize % instances.len()].clone();
                    let mut task = TestTask::new(model.clone(), *task_type, *prompt_type);
                    task.difficulty = spec.difficulty;
                    task.tool_success_rate = spec.tool_success_rate;
                    task.timeout_seconds = spec.timeout_seconds;
                    task.required_tools = instance.required_tools.clone();
                    task.task_instance = Some(instance);
                    tasks.push(task);
                }
            }
        }
    }

    let mut rng = match spec.seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };
    tasks.shuffle(&mut rng);
    Ok(tasks)
}
