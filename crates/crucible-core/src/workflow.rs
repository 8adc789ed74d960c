//! Workflow objects, flaw injection, and the external task/workflow
//! contracts.
//!
//! Workflows come from outside the core (a generator model or a library
//! file with pregenerated sequences). The core never mutates one in
//! place: flawed tests perturb a copy and keep the original around as the
//! scoring reference.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::ExecError;
use crate::model::{Difficulty, FlawType, PromptType, TaskInstance, TaskType};
use crate::tools::{ToolCategory, ToolRegistry};

/// Read-only workflow handed to the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub optimal_sequence: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Workflow as presented to the model, paired with the unperturbed
/// sequence that scoring runs against.
#[derive(Debug, Clone)]
pub struct PreparedWorkflow {
    pub presented: Workflow,
    pub reference_sequence: Vec<String>,
}

/// Perturb the workflow for the given prompt strategy. Base strategies
/// present the workflow unchanged; flawed strategies inject the named
/// defect into a copy.
pub fn prepare<R: Rng>(
    workflow: Workflow,
    prompt_type: PromptType,
    registry: &ToolRegistry,
    rng: &mut R,
) -> PreparedWorkflow {
    let reference_sequence = workflow.optimal_sequence.clone();
    let presented = match prompt_type.flaw_type() {
        Some(flaw) => inject_flaw(&workflow, flaw, registry, rng),
        None => workflow,
    };
    PreparedWorkflow { presented, reference_sequence }
}

/// Apply one flaw from the catalogue to a copy of `workflow`.
///
/// Sequences too short for a given flaw (e.g. `missing_step` on a
/// two-step plan) come back unchanged; the prompt still advertises the
/// flawed framing, which is the measurable part.
pub fn inject_flaw<R: Rng>(
    workflow: &Workflow,
    flaw: FlawType,
    registry: &ToolRegistry,
    rng: &mut R,
) -> Workflow {
    let mut flawed = workflow.clone();
    let seq = &mut flawed.optimal_sequence;
    match flaw {
        FlawType::SequenceDisorder => {
            // Swap adjacent pairs: (0,1), (2,3), ...
            let mut i = 0;
            while i + 1 < seq.len() {
                seq.swap(i, i + 1);
                i += 2;
            }
        }
        FlawType::ToolMisuse => {
            if let Some(idx) = pick_index(seq.len(), rng) {
                let wrong = registry.alternatives(&seq[idx], false);
                if !wrong.is_empty() {
                    seq[idx] = wrong[rng.gen_range(0..wrong.len())].name.clone();
                }
            }
        }
        FlawType::ParameterError => {
            // Names stay intact so call matching still works; the prompt
            // renderer reads the marker and presents bogus parameters for
            // that step.
            if let Some(idx) = pick_index(seq.len(), rng) {
                set_meta(&mut flawed.metadata, "parameter_error_step", idx);
            }
        }
        FlawType::MissingStep => {
            if seq.len() >= 3 {
                let idx = rng.gen_range(1..seq.len() - 1);
                seq.remove(idx);
            }
        }
        FlawType::RedundantOperations => {
            if let Some(idx) = pick_index(seq.len(), rng) {
                let dup = seq[idx].clone();
                seq.insert(idx + 1, dup);
            }
        }
        FlawType::LogicalInconsistency => {
            // An output operation scheduled before any input has run.
            let first_input = seq
                .iter()
                .position(|t| ToolCategory::infer(t) == ToolCategory::Input);
            let output_tool = seq
                .iter()
                .find(|t| ToolCategory::infer(t) == ToolCategory::Output)
                .cloned()
                .or_else(|| {
                    registry
                        .any_in_category(ToolCategory::Output)
                        .map(|t| t.name.clone())
                });
            if let (Some(pos), Some(tool)) = (first_input, output_tool) {
                seq.insert(pos, tool);
            }
        }
        FlawType::SemanticDrift => {
            if let Some(idx) = pick_index(seq.len(), rng) {
                let near = registry.alternatives(&seq[idx], true);
                if !near.is_empty() {
                    seq[idx] = near[rng.gen_range(0..near.len())].name.clone();
                }
            }
        }
    }
    set_meta_str(&mut flawed.metadata, "injected_flaw", flaw.as_str());
    flawed
}

fn pick_index<R: Rng>(len: usize, rng: &mut R) -> Option<usize> {
    if len == 0 {
        None
    } else {
        Some(rng.gen_range(0..len))
    }
}

fn set_meta(meta: &mut serde_json::Value, key: &str, value: usize) {
    if !meta.is_object() {
        *meta = serde_json::json!({});
    }
    meta[key] = serde_json::json!(value);
}

fn set_meta_str(meta: &mut serde_json::Value, key: &str, value: &str) {
    if !meta.is_object() {
        *meta = serde_json::json!({});
    }
    meta[key] = serde_json::json!(value);
}

// ── External contracts ───────────────────────────────────────────────────

/// Source of workflows for task instances. The generator model behind the
/// real implementation is the host's concern; the core only sees this
/// trait.
pub trait WorkflowProvider: Send + Sync {
    fn workflow_for(
        &self,
        task_type: TaskType,
        instance: &TaskInstance,
    ) -> Result<Workflow, ExecError>;
}

/// Serves only workflows already embedded in task instances. Selected when
/// model loading is skipped; generation failures surface as `no_workflow`.
#[derive(Debug, Default)]
pub struct PregeneratedWorkflowProvider;

impl WorkflowProvider for PregeneratedWorkflowProvider {
    fn workflow_for(
        &self,
        task_type: TaskType,
        instance: &TaskInstance,
    ) -> Result<Workflow, ExecError> {
        instance.workflow.clone().ok_or_else(|| {
            ExecError::NoWorkflow(format!(
                "instance {} of {} has no pregenerated workflow",
                instance.id, task_type
            ))
        })
    }
}

/// Source of task instances, keyed by difficulty and task type.
pub trait TaskLibrary: Send + Sync {
    fn instances(&self, difficulty: Difficulty, task_type: TaskType) -> Vec<TaskInstance>;
}

#[derive(Debug, Deserialize)]
struct LibraryEntry {
    task_type: TaskType,
    #[serde(default)]
    difficulty: Option<Difficulty>,
    #[serde(flatten)]
    instance: TaskInstance,
}

#[derive(Debug, Deserialize)]
struct LibraryFile {
    tasks: Vec<LibraryEntry>,
}

/// Task library backed by a JSON file of `{ "tasks": [...] }` entries.
/// Entries without an explicit difficulty load into every difficulty
/// bucket the file is opened for.
#[derive(Debug, Default)]
pub struct JsonTaskLibrary {
    by_difficulty: BTreeMap<Difficulty, BTreeMap<TaskType, Vec<TaskInstance>>>,
}

impl JsonTaskLibrary {
    /// Load a library file. `per_type_limit` implements partial loading:
    /// at most N instances per task type are kept, which keeps startup
    /// memory flat on the large generated libraries.
    pub fn load(
        path: &Path,
        difficulty: Difficulty,
        per_type_limit: Option<usize>,
    ) -> anyhow::Result<JsonTaskLibrary> {
        let raw = std::fs::read_to_string(path)?;
        let file: LibraryFile = serde_json::from_str(&raw)?;
        let total = file.tasks.len();
        let mut lib = JsonTaskLibrary::default();
        let mut kept = 0usize;
        for entry in file.tasks {
            let bucket_difficulty = entry.difficulty.unwrap_or(difficulty);
            if bucket_difficulty != difficulty {
                continue;
            }
            let bucket = lib
                .by_difficulty
                .entry(difficulty)
                .or_default()
                .entry(entry.task_type)
                .or_default();
            if let Some(limit) = per_type_limit {
                if bucket.len() >= limit {
                    continue;
                }
            }
            bucket.push(entry.instance);
            kept += 1;
        }
        tracing::info!(
            path = %path.display(),
            difficulty = %difficulty,
            kept,
            total,
            "task library loaded"
        );
        Ok(lib)
    }

    /// Build a registry covering every tool mentioned by the loaded
    /// instances and their pregenerated workflows.
    pub fn tool_registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for types in self.by_difficulty.values() {
            for instances in types.values() {
                for instance in instances {
                    for tool in &instance.required_tools {
                        registry.ensure(tool);
                    }
                    if let Some(wf) = &instance.workflow {
                        for tool in wf.optimal_sequence.iter().chain(&wf.required_tools) {
                            registry.ensure(tool);
                        }
                    }
                }
            }
        }
        registry
    }
}

impl TaskLibrary for JsonTaskLibrary {
    fn instances(&self, difficulty: Difficulty, task_type: TaskType) -> Vec<TaskInstance> {
        self.by_difficulty
            .get(&difficulty)
            .and_then(|types| types.get(&task_type))
            .cloned()
            .unwrap_or_default()
    }
}

/// In-memory library for tests and synthetic batches.
#[derive(Debug, Default)]
pub struct StaticTaskLibrary {
    by_type: BTreeMap<TaskType, Vec<TaskInstance>>,
}

impl StaticTaskLibrary {
    pub fn insert(&mut self, task_type: TaskType, instance: TaskInstance) {
        self.by_type.entry(task_type).or_default().push(instance);
    }
}

impl TaskLibrary for StaticTaskLibrary {
    fn instances(&self, _difficulty: Difficulty, task_type: TaskType) -> Vec<TaskInstance> {
        self.by_type.get(&task_type).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        for name in [
            "data_reader",
            "file_reader",
            "data_parser",
            "data_transformer",
            "schema_validator",
            "file_writer",
            "report_exporter",
        ] {
            r.ensure(name);
        }
        r
    }

    fn pipeline() -> Workflow {
        Workflow {
            task_type: "data_pipeline".into(),
            optimal_sequence: vec![
                "data_reader".into(),
                "data_parser".into(),
                "data_transformer".into(),
                "schema_validator".into(),
                "file_writer".into(),
            ],
            required_tools: vec!["data_reader".into(), "file_writer".into()],
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn injection_never_mutates_the_original() {
        let wf = pipeline();
        let mut rng = StdRng::seed_from_u64(7);
        for flaw in FlawType::ALL {
            let _ = inject_flaw(&wf, flaw, &registry(), &mut rng);
        }
        assert_eq!(wf.optimal_sequence.len(), 5);
        assert_eq!(wf.optimal_sequence[0], "data_reader");
    }

    #[test]
    fn sequence_disorder_swaps_adjacent_pairs() {
        let mut rng = StdRng::seed_from_u64(1);
        let flawed = inject_flaw(&pipeline(), FlawType::SequenceDisorder, &registry(), &mut rng);
        assert_eq!(
            flawed.optimal_sequence,
            vec![
                "data_parser",
                "data_reader",
                "schema_validator",
                "data_transformer",
                "file_writer"
            ]
        );
    }

    #[test]
    fn missing_step_drops_an_interior_step() {
        let mut rng = StdRng::seed_from_u64(2);
        let flawed = inject_flaw(&pipeline(), FlawType::MissingStep, &registry(), &mut rng);
        assert_eq!(flawed.optimal_sequence.len(), 4);
        assert_eq!(flawed.optimal_sequence.first().map(String::as_str), Some("data_reader"));
        assert_eq!(flawed.optimal_sequence.last().map(String::as_str), Some("file_writer"));
    }

    #[test]
    fn redundant_operations_duplicates_one_step() {
        let mut rng = StdRng::seed_from_u64(3);
        let flawed =
            inject_flaw(&pipeline(), FlawType::RedundantOperations, &registry(), &mut rng);
        assert_eq!(flawed.optimal_sequence.len(), 6);
        let dup = flawed
            .optimal_sequence
            .windows(2)
            .any(|w| w[0] == w[1]);
        assert!(dup, "expected an adjacent duplicate: {:?}", flawed.optimal_sequence);
    }

    #[test]
    fn logical_inconsistency_places_output_before_input() {
        let mut rng = StdRng::seed_from_u64(4);
        let flawed =
            inject_flaw(&pipeline(), FlawType::LogicalInconsistency, &registry(), &mut rng);
        let first_output = flawed
            .optimal_sequence
            .iter()
            .position(|t| ToolCategory::infer(t) == ToolCategory::Output);
        let first_input = flawed
            .optimal_sequence
            .iter()
            .position(|t| ToolCategory::infer(t) == ToolCategory::Input);
        assert!(first_output.unwrap() < first_input.unwrap());
    }

    #[test]
    fn semantic_drift_swaps_within_category() {
        let wf = Workflow {
            optimal_sequence: vec!["data_reader".into()],
            ..pipeline()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let flawed = inject_flaw(&wf, FlawType::SemanticDrift, &registry(), &mut rng);
        assert_eq!(flawed.optimal_sequence, vec!["file_reader".to_string()]);
    }

    #[test]
    fn parameter_error_marks_a_step_without_renaming() {
        let mut rng = StdRng::seed_from_u64(6);
        let flawed = inject_flaw(&pipeline(), FlawType::ParameterError, &registry(), &mut rng);
        assert_eq!(flawed.optimal_sequence, pipeline().optimal_sequence);
        assert!(flawed.metadata.get("parameter_error_step").is_some());
    }

    #[test]
    fn prepare_keeps_reference_sequence_for_flawed_prompts() {
        let mut rng = StdRng::seed_from_u64(8);
        let prepared = prepare(
            pipeline(),
            PromptType::Flawed(FlawType::MissingStep),
            &registry(),
            &mut rng,
        );
        assert_eq!(prepared.reference_sequence.len(), 5);
        assert_eq!(prepared.presented.optimal_sequence.len(), 4);
    }

    #[test]
    fn pregenerated_provider_fails_closed() {
        let provider = PregeneratedWorkflowProvider;
        let bare = TaskInstance { id: "t1".into(), ..TaskInstance::default() };
        let err = provider
            .workflow_for(TaskType::SimpleTask, &bare)
            .unwrap_err();
        assert!(matches!(err, ExecError::NoWorkflow(_)));

        let with_wf = TaskInstance { workflow: Some(pipeline()), ..bare };
        assert!(provider.workflow_for(TaskType::SimpleTask, &with_wf).is_ok());
    }
}
