//! Crucible core: a concurrent evaluation harness for tool-using LLM
//! agents.
//!
//! The pipeline per test: the [`runner::BatchRunner`] pulls a planned
//! [`model::TestTask`], waits on the provider's
//! [`limiter::AdaptiveRateLimiter`], drives the
//! [`executor::Executor`] against an [`providers::llm::LlmClient`],
//! classifies anything short of full success, and appends the record to a
//! [`store::ResultStore`] that checkpoints a row log plus an aggregated
//! summary document. Workflow generation, tool capability indexing, and
//! model training live outside this crate; the runner consumes them
//! through the [`workflow`] contracts.

pub mod classifier;
pub mod config;
pub mod errors;
pub mod executor;
pub mod limiter;
pub mod model;
pub mod providers;
pub mod runner;
pub mod store;
pub mod tools;
pub mod transcript;
pub mod workflow;

pub use classifier::{Classification, ErrorCategory, ErrorClassifier};
pub use errors::{ErrorKind, ExecError};
pub use limiter::{AdaptiveRateLimiter, LimiterConfig, ProviderKind};
pub use model::{
    Difficulty, FlawType, PromptType, SuccessLevel, TaskInstance, TaskType, TestRecord,
    TestResult, TestTask,
};
pub use runner::{BatchRunner, RunReport, RunnerOptions};
pub use store::{CheckpointPolicy, CumulativeStore, ResultStore};
pub use workflow::{TaskLibrary, Workflow, WorkflowProvider};
