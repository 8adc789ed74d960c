//! Human-readable test transcript.
//!
//! Built in memory for every test regardless of the file-logging policy:
//! the error classifier reads the rendered text. Persisted to one UTF-8
//! file per test only when log saving is enabled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::model::{ChatMessage, ExecutionStep, Role, TaskInstance, TestTask};

/// Complete interaction log for one test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    /// Encodes model, task type, instance and prompt strategy:
    /// `<model>_<task_type>_inst<N>_test<R>_<prompt>[_<flaw>]`.
    pub test_id: String,
    pub task_type: String,
    pub prompt_type: String,
    pub timestamp: String,
    pub required_tools: Vec<String>,
    pub task_description: String,
    /// The initial prompt presented on turn 1.
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tool_calls: Vec<String>,
    pub steps: Vec<ExecutionStep>,
    /// Filled in once the result is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TranscriptResult>,
}

/// Final result block rendered at the end of the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub success: bool,
    pub success_level: String,
    pub final_score: f64,
    pub workflow_score: f64,
    pub phase2_score: f64,
    pub execution_time_seconds: f64,
    pub format_error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl Transcript {
    /// Start a transcript for a task. `ordinal` disambiguates repeated
    /// tests of the same cell; callers draw it from their rng.
    pub fn begin(task: &TestTask, instance: Option<&TaskInstance>, ordinal: u32) -> Transcript {
        let instance_id = instance.map(|i| i.id.as_str()).unwrap_or("0");
        Transcript {
            test_id: test_id(&task.model, task, instance_id, ordinal),
            task_type: task.task_type.to_string(),
            prompt_type: task.prompt_type.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            required_tools: instance
                .map(|i| i.required_tools.clone())
                .unwrap_or_else(|| task.required_tools.clone()),
            task_description: instance
                .map(|i| i.description.clone())
                .unwrap_or_default(),
            prompt: String::new(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            steps: Vec::new(),
            result: None,
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_step(&mut self, step: ExecutionStep) {
        self.steps.push(step);
    }

    /// Render the sectioned text form the classifier consumes and the log
    /// file stores.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);
        let push_line = |out: &mut String, line: &str| {
            out.push_str(line);
            out.push('\n');
        };

        push_line(&mut out, &format!("Test Log: {}", self.test_id));
        push_line(&mut out, &"=".repeat(80));
        out.push('\n');

        push_line(&mut out, &format!("Task Type: {}", self.task_type));
        push_line(&mut out, &format!("Prompt Type: {}", self.prompt_type));
        push_line(&mut out, &format!("Timestamp: {}", self.timestamp));
        out.push('\n');

        push_line(&mut out, "Task Instance:");
        push_line(&mut out, &"-".repeat(40));
        push_line(&mut out, &format!("Required Tools: {:?}", self.required_tools));
        push_line(
            &mut out,
            &format!(
                "Description: {}",
                if self.task_description.is_empty() { "N/A" } else { self.task_description.as_str() }
            ),
        );
        out.push('\n');

        push_line(&mut out, "Prompt:");
        push_line(&mut out, &"-".repeat(40));
        push_line(
            &mut out,
            if self.prompt.is_empty() { "Not captured" } else { self.prompt.as_str() },
        );
        out.push('\n');

        push_line(&mut out, "LLM Response:");
        push_line(&mut out, &"-".repeat(40));
        let last_assistant = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .unwrap_or("Not captured");
        push_line(&mut out, last_assistant);
        out.push('\n');

        push_line(&mut out, "Conversation History:");
        push_line(&mut out, &"-".repeat(40));
        if self.messages.is_empty() {
            push_line(&mut out, "(No conversation history recorded)");
        } else {
            let mut by_turn: BTreeMap<u32, Vec<&ChatMessage>> = BTreeMap::new();
            for msg in &self.messages {
                by_turn.entry(msg.turn).or_default().push(msg);
            }
            for (turn, msgs) in by_turn {
                out.push('\n');
                push_line(&mut out, &format!("Turn {turn}:"));
                for msg in msgs {
                    let label = match msg.role {
                        Role::Assistant => "Assistant",
                        Role::User => "User",
                    };
                    push_line(&mut out, &format!("  {label}: {}", msg.content));
                }
            }
        }
        out.push('\n');

        push_line(&mut out, "Extracted Tool Calls:");
        push_line(&mut out, &"-".repeat(40));
        push_line(&mut out, &format!("{:?}", self.tool_calls));
        out.push('\n');

        push_line(&mut out, "Execution History:");
        push_line(&mut out, &"-".repeat(40));
        for (i, step) in self.steps.iter().enumerate() {
            let status = if step.success { "ok" } else { "failed" };
            let mut line = format!("Step {}: turn {} {} -> {status}", i + 1, step.turn, step.tool);
            if let Some(err) = &step.error {
                line.push_str(&format!(" ({err})"));
            }
            push_line(&mut out, &line);
        }
        out.push('\n');

        if let Some(result) = &self.result {
            push_line(&mut out, "Results:");
            push_line(&mut out, &"-".repeat(40));
            push_line(&mut out, &format!("Success: {}", result.success));
            push_line(&mut out, &format!("Success Level: {}", result.success_level));
            push_line(&mut out, &format!("Final Score: {:.3}", result.final_score));
            push_line(&mut out, &format!("Workflow Score: {:.3}", result.workflow_score));
            push_line(&mut out, &format!("Phase2 Score: {:.3}", result.phase2_score));
            push_line(
                &mut out,
                &format!("Execution Time: {:.2}s", result.execution_time_seconds),
            );
            push_line(
                &mut out,
                &format!("Format Errors: {}", result.format_error_count),
            );
            if let Some(err) = &result.error {
                push_line(&mut out, &format!("Error: {err}"));
                if let Some(kind) = &result.error_kind {
                    push_line(&mut out, &format!("Error Kind: {kind}"));
                }
            }
        }

        out
    }

    /// Write the rendered transcript under `dir`, named after the test id.
    pub fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.txt", self.test_id));
        std::fs::write(&path, self.render())?;
        Ok(path)
    }
}

/// `<model>_<task_type>_inst<N>_test<R>_<prompt>[_<flaw>]` with the model
/// name sanitized for filesystem use.
fn test_id(model: &str, task: &TestTask, instance_id: &str, ordinal: u32) -> String {
    let model_safe = model.replace(['-', '.'], "_");
    let prompt_part = match task.flaw_type() {
        Some(flaw) => format!("flawed_{}", flaw.as_str()),
        None => task.prompt_type.to_string(),
    };
    format!(
        "{model_safe}_{}_inst{instance_id}_test{ordinal}_{prompt_part}",
        task.task_type
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlawType, PromptType, TaskType, TestTask};

    fn task() -> TestTask {
        TestTask::new("gpt-4o-mini", TaskType::DataPipeline, PromptType::Optimal)
    }

    #[test]
    fn test_id_sanitizes_model_and_encodes_flaw() {
        let mut t = task();
        t.prompt_type = PromptType::Flawed(FlawType::ToolMisuse);
        let tr = Transcript::begin(&t, None, 42);
        assert!(tr.test_id.starts_with("gpt_4o_mini_data_pipeline_inst0_test42_flawed_tool_misuse"));
    }

    #[test]
    fn render_contains_all_sections() {
        let t = task();
        let mut tr = Transcript::begin(&t, None, 1);
        tr.prompt = "do the thing".into();
        tr.push_message(ChatMessage::assistant("TOOL_CALL: data_reader()", 1));
        tr.push_message(ChatMessage::user("Tool data_reader executed successfully", 1));
        tr.push_step(ExecutionStep { turn: 1, tool: "data_reader".into(), success: true, error: None });
        tr.tool_calls.push("data_reader".into());
        tr.result = Some(TranscriptResult {
            success: true,
            success_level: "full_success".into(),
            final_score: 1.0,
            workflow_score: 1.0,
            phase2_score: 1.0,
            execution_time_seconds: 0.5,
            format_error_count: 0,
            error: None,
            error_kind: None,
        });
        let text = tr.render();
        for section in [
            "Test Log:",
            "Task Instance:",
            "Prompt:",
            "LLM Response:",
            "Conversation History:",
            "Turn 1:",
            "Extracted Tool Calls:",
            "Execution History:",
            "Results:",
        ] {
            assert!(text.contains(section), "missing section {section}");
        }
    }

    #[test]
    fn save_writes_one_file_per_test() {
        let dir = tempfile::tempdir().unwrap();
        let tr = Transcript::begin(&task(), None, 9);
        let path = tr.save_to(dir.path()).unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".txt"));
    }
}
