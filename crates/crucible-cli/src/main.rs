//! Batch CLI for the crucible harness.
//!
//! Thin wrapper: parse flags, wire the providers and the store, plan the
//! Cartesian batch, run it. Exit code 0 means the batch completed (failed
//! tests included); non-zero is reserved for infrastructure errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crucible_core::classifier::{ErrorClassifier, LlmErrorClassifier, RuleClassifier};
use crucible_core::config::EnvConfig;
use crucible_core::executor::scoring::RubricScorer;
use crucible_core::model::{Difficulty, MAX_TIMEOUT_SECS};
use crucible_core::providers::llm::http::OpenAiCompatClient;
use crucible_core::providers::llm::LlmClient;
use crucible_core::runner::planner::{plan, PlanSpec};
use crucible_core::runner::{BatchRunner, RunnerOptions};
use crucible_core::store::summary::SummaryFilter;
use crucible_core::store::{CheckpointPolicy, CumulativeStore, ResultStore};
use crucible_core::workflow::{JsonTaskLibrary, PregeneratedWorkflowProvider};

const EXIT_OK: i32 = 0;
const EXIT_INFRA: i32 = 2;

#[derive(Parser)]
#[command(name = "crucible", about = "Concurrent evaluation harness for tool-using LLM agents")]
struct Cli {
    /// Model id(s) to evaluate (repeatable).
    #[arg(long = "model", required_unless_present_any = ["progress", "clear"])]
    models: Vec<String>,

    /// Tests per (model, prompt, task-type) cell.
    #[arg(long, default_value_t = 1)]
    count: u32,

    #[arg(long, default_value = "easy")]
    difficulty: String,

    /// Comma-separated task types, or "all".
    #[arg(long = "task-types", default_value = "all", value_delimiter = ',')]
    task_types: Vec<String>,

    /// Comma-separated prompt strategies, or "all".
    #[arg(long = "prompt-types", default_value = "all", value_delimiter = ',')]
    prompt_types: Vec<String>,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Initial QPS handed to the limiter.
    #[arg(long)]
    qps: Option<u32>,

    /// Adaptive rate limiting (downscale on throttle, recover on success).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    adaptive: bool,

    /// Records buffered before a checkpoint flush.
    #[arg(long = "checkpoint-interval", default_value_t = 20)]
    checkpoint_interval: usize,

    /// Soft per-task timeout in seconds (hard ceiling 900).
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Bernoulli success rate of the simulated tool layer.
    #[arg(long = "tool-success-rate", default_value_t = 0.8)]
    tool_success_rate: f64,

    /// Persist one transcript file per test.
    #[arg(long = "save-logs")]
    save_logs: bool,

    /// Clear stored statistics (for --model when given, else all) and exit.
    #[arg(long)]
    clear: bool,

    /// Print the stored summary and exit.
    #[arg(long)]
    progress: bool,

    /// Task library JSON ({"tasks": [...]}).
    #[arg(long = "task-library", default_value = "task_library.json")]
    task_library: PathBuf,

    /// Store directory (row log + summary document).
    #[arg(long = "store-dir", default_value = "results")]
    store_dir: PathBuf,

    /// Chat endpoint base URL.
    #[arg(long = "api-base", env = "LLM_API_BASE", default_value = "https://api.openai.com/v1")]
    api_base: String,

    /// API key for the chat endpoint.
    #[arg(long = "api-key", env = "LLM_API_KEY", default_value = "")]
    api_key: String,

    /// Model used by the LLM error classifier.
    #[arg(long = "classifier-model", default_value = "gpt-5-nano")]
    classifier_model: String,

    /// Classify failures with the LLM classifier (rule fallback otherwise).
    #[arg(long = "ai-classification", default_value_t = true, action = clap::ArgAction::Set)]
    ai_classification: bool,

    /// Shuffle seed for the planner.
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            EXIT_INFRA
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let env = EnvConfig::from_env();
    let store = Arc::new(
        CumulativeStore::open(
            &cli.store_dir,
            env.storage_format,
            CheckpointPolicy::with_interval(cli.checkpoint_interval),
        )
        .context("cannot open result store")?,
    );

    if cli.clear {
        let model = cli.models.first().map(String::as_str);
        store.clear(model).context("clear failed")?;
        println!("cleared statistics for {}", model.unwrap_or("all models"));
        return Ok(EXIT_OK);
    }

    if cli.progress {
        let filter = SummaryFilter {
            model: cli.models.first().cloned(),
            ..SummaryFilter::default()
        };
        let summary = store.query_summary(&filter)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(EXIT_OK);
    }

    let difficulty = Difficulty::parse(&cli.difficulty)
        .with_context(|| format!("unknown difficulty: {}", cli.difficulty))?;

    let library = JsonTaskLibrary::load(&cli.task_library, difficulty, env.partial_load_limit())
        .with_context(|| format!("cannot load task library {}", cli.task_library.display()))?;
    let registry = Arc::new(library.tool_registry());
    anyhow::ensure!(
        !registry.is_empty(),
        "task library {} mentions no tools",
        cli.task_library.display()
    );

    anyhow::ensure!(
        !cli.api_key.is_empty(),
        "no API key: pass --api-key or set LLM_API_KEY"
    );
    let client: Arc<dyn LlmClient> =
        Arc::new(OpenAiCompatClient::new(cli.api_base.clone(), cli.api_key.clone()));

    if !env.skip_model_loading {
        tracing::info!(
            "no workflow generator is linked into this binary; serving pregenerated \
             workflows only (set SKIP_MODEL_LOADING=1 to make that explicit)"
        );
    }

    let classifier: Arc<dyn ErrorClassifier> = if cli.ai_classification {
        Arc::new(LlmErrorClassifier::new(Arc::clone(&client), cli.classifier_model.clone()))
    } else {
        Arc::new(RuleClassifier)
    };

    let spec = PlanSpec {
        models: cli.models.clone(),
        prompt_types: cli.prompt_types.clone(),
        task_types: cli.task_types.clone(),
        difficulty,
        per_cell: cli.count,
        tool_success_rate: cli.tool_success_rate,
        timeout_seconds: cli.timeout.min(MAX_TIMEOUT_SECS),
        seed: cli.seed,
    };
    let tasks = plan(&spec, &library)?;
    anyhow::ensure!(!tasks.is_empty(), "plan produced no tasks; check the task library");

    let runner = BatchRunner::new(
        client,
        Arc::new(RubricScorer),
        classifier,
        Arc::new(PregeneratedWorkflowProvider),
        registry,
        store,
        RunnerOptions {
            workers: cli.workers,
            adaptive: cli.adaptive,
            qps: cli.qps,
            save_logs: cli.save_logs,
            log_dir: env.log_dir.clone(),
            hard_timeout: Duration::from_secs(MAX_TIMEOUT_SECS),
            batch_timeout: None,
            progress_every: 10,
        },
    );

    let report = runner.run(tasks).await.context("batch run failed")?;
    println!(
        "completed {}/{} ({} succeeded, {} failed, {} throttle retries)",
        report.completed, report.total, report.succeeded, report.failed, report.throttle_retries
    );
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_documented_ones() {
        let cli = Cli::parse_from(["crucible", "--model", "gpt-4o-mini"]);
        assert_eq!(cli.count, 1);
        assert_eq!(cli.workers, 4);
        assert_eq!(cli.timeout, 600);
        assert_eq!(cli.checkpoint_interval, 20);
        assert!(cli.adaptive);
        assert!(!cli.save_logs);
        assert_eq!(cli.difficulty, "easy");
        assert_eq!(cli.task_types, vec!["all"]);
    }

    #[test]
    fn comma_separated_axes_split() {
        let cli = Cli::parse_from([
            "crucible",
            "--model",
            "m",
            "--task-types",
            "data_pipeline,api_integration",
            "--prompt-types",
            "baseline,flawed_missing_step",
        ]);
        assert_eq!(cli.task_types, vec!["data_pipeline", "api_integration"]);
        assert_eq!(cli.prompt_types, vec!["baseline", "flawed_missing_step"]);
    }

    #[test]
    fn model_is_optional_for_progress_and_clear() {
        assert!(Cli::try_parse_from(["crucible"]).is_err());
        assert!(Cli::try_parse_from(["crucible", "--progress"]).is_ok());
        assert!(Cli::try_parse_from(["crucible", "--clear"]).is_ok());
    }

    #[test]
    fn repeated_model_flags_accumulate() {
        let cli = Cli::parse_from(["crucible", "--model", "a", "--model", "b"]);
        assert_eq!(cli.models, vec!["a", "b"]);
    }
}
