//! Prompt templates, one per strategy.
//!
//! The tool-call format and the completion marker are part of the
//! executor's contract with the model: the parser and the turn loop both
//! key off them.

use crate::model::{TaskInstance, TestTask};
use crate::tools::ToolRegistry;
use crate::workflow::PreparedWorkflow;

/// Marker the model must emit when it considers the task done.
pub const COMPLETION_MARKER: &str = "TASK_COMPLETED";

const FORMAT_RULES: &str = "\
## Tool Usage Format:
Each tool must be called using this exact format:
TOOL_CALL: tool_name(param1=\"value1\", param2=\"value2\")

## Important Guidelines:
- You MUST use tools to complete this task
- Each tool call must be on a separate line
- Use quotes around all parameter values
- When the task is complete, reply with TASK_COMPLETED

Remember: a response without tool calls will be considered a failure.
";

/// Render the initial prompt for a task. The presented workflow is already
/// flawed when the strategy calls for it.
pub fn render(
    task: &TestTask,
    instance: Option<&TaskInstance>,
    prepared: &PreparedWorkflow,
    registry: &ToolRegistry,
) -> String {
    if task.prompt_type.is_flawed() {
        return flawed_prompt(task, instance, prepared);
    }
    match task.prompt_type {
        crate::model::PromptType::Baseline => baseline_prompt(task, instance, registry),
        crate::model::PromptType::Cot => {
            let mut p = String::from(
                "Before executing, think step by step: identify the inputs, the \
                 transformations required, and the expected outputs. Then follow \
                 the workflow plan below.\n\n",
            );
            p.push_str(&optimal_prompt(task, instance, prepared));
            p
        }
        _ => optimal_prompt(task, instance, prepared),
    }
}

fn description_block(task: &TestTask, instance: Option<&TaskInstance>) -> String {
    let description = instance
        .map(|i| i.description.as_str())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!("Complete a {} using the available tools.", task.task_type.as_str().replace('_', " "))
        });
    format!("## Task Description:\n{description}\n")
}

fn baseline_prompt(task: &TestTask, instance: Option<&TaskInstance>, registry: &ToolRegistry) -> String {
    let mut tools: Vec<String> = registry
        .specs()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();
    tools.truncate(10);
    format!(
        "You are an AI assistant specialized in {task_type} tasks.\n\n\
         {description}\n\
         ## Available Tools:\n{tools}\n\n\
         ## How to Complete This Task:\n\
         1. Start with input/reading operations\n\
         2. Process and transform the data\n\
         3. Validate if necessary\n\
         4. Output the results\n\n\
         {FORMAT_RULES}",
        task_type = task.task_type,
        description = description_block(task, instance),
        tools = tools.join("\n"),
    )
}

fn optimal_prompt(task: &TestTask, instance: Option<&TaskInstance>, prepared: &PreparedWorkflow) -> String {
    format!(
        "You are executing a {task_type} task following a workflow plan.\n\n\
         {description}\n\
         ## WORKFLOW EXECUTION PLAN:\n{steps}\n\
         ## EXECUTION RULES:\n\
         1. Execute the workflow steps in order\n\
         2. Call exactly the tools listed, one per step\n\
         3. Report results after the final step\n\n\
         {FORMAT_RULES}",
        task_type = task.task_type,
        description = description_block(task, instance),
        steps = step_list(&prepared.presented),
    )
}

fn flawed_prompt(task: &TestTask, instance: Option<&TaskInstance>, prepared: &PreparedWorkflow) -> String {
    format!(
        "You are executing a {task_type} task following a workflow plan.\n\n\
         {description}\n\
         ## WORKFLOW EXECUTION PLAN:\n\
         Note: This workflow may have some inefficiencies, but follow it as closely as possible.\n\n\
         {steps}\n\
         ## EXECUTION RULES:\n\
         1. Try to follow the workflow steps in order\n\
         2. If a step seems incorrect, note it but continue\n\
         3. Adapt as needed to complete the task\n\
         4. Report any issues encountered\n\n\
         {FORMAT_RULES}",
        task_type = task.task_type,
        description = description_block(task, instance),
        steps = step_list(&prepared.presented),
    )
}

fn step_list(workflow: &crate::workflow::Workflow) -> String {
    let param_error_step = workflow
        .metadata
        .get("parameter_error_step")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);
    let mut out = String::new();
    for (i, tool) in workflow.optimal_sequence.iter().enumerate() {
        if param_error_step == Some(i) {
            out.push_str(&format!(
                "STEP {}: {tool} (params: mode=\"__invalid__\", target=\"\")\n",
                i + 1
            ));
        } else {
            out.push_str(&format!("STEP {}: {tool}\n", i + 1));
        }
    }
    out
}
