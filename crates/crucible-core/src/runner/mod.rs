//! Batch orchestration: worker pool, retry queue, timeouts, store feed.
//!
//! Workers pull tasks from a shared deque (retries drain preferentially
//! once their backlog reaches the worker count), gate on the provider's
//! limiter, execute under the runner-owned deadlines, and push finished
//! records through a channel into the store task. Throttled tasks are
//! requeued and never produce a record.

pub mod planner;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::classifier::ErrorClassifier;
use crate::errors::{ErrorKind, ExecError};
use crate::executor::scoring::QualityScorer;
use crate::executor::Executor;
use crate::limiter::{AdaptiveRateLimiter, LimiterConfig, ProviderKind};
use crate::model::{SuccessLevel, TestRecord, TestResult, TestTask};
use crate::providers::llm::LlmClient;
use crate::store::ResultStore;
use crate::tools::ToolRegistry;
use crate::transcript::{Transcript, TranscriptResult};
use crate::workflow::{prepare, WorkflowProvider};

pub const HARD_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub workers: usize,
    /// Adjust limits under throttling. When off, the limiter is pinned to
    /// the configured worker/QPS values; the QPS gate still paces calls.
    pub adaptive: bool,
    /// Initial QPS for new limiters; `None` keeps the profile default.
    pub qps: Option<u32>,
    pub save_logs: bool,
    pub log_dir: PathBuf,
    /// Wall-clock ceiling per task, applied on top of each task's own
    /// soft timeout. Both deadlines are the runner's; the executor only
    /// watches the cancellation flag.
    pub hard_timeout: Duration,
    /// Whole-batch ceiling; `None` derives it from the task count.
    pub batch_timeout: Option<Duration>,
    pub progress_every: u64,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            adaptive: true,
            qps: None,
            save_logs: false,
            log_dir: PathBuf::from("test_logs"),
            hard_timeout: HARD_TIMEOUT,
            batch_timeout: None,
            progress_every: 10,
        }
    }
}

/// `max(3600, min(14400, n·60))` seconds.
pub fn derived_batch_timeout(task_count: usize) -> Duration {
    Duration::from_secs((task_count as u64 * 60).clamp(3600, 14_400))
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub total: usize,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub throttle_retries: u64,
    pub cancelled: bool,
    pub records: Vec<TestRecord>,
}

// ── Shared limiter map ──────────────────────────────────────────────────

/// One limiter per provider kind, created on first use. Shared between
/// the runner and its workers.
pub struct LimiterSet {
    adaptive: bool,
    pinned_workers: u32,
    qps_override: Option<u32>,
    limiters: Mutex<HashMap<ProviderKind, Arc<AdaptiveRateLimiter>>>,
}

impl LimiterSet {
    pub fn new(adaptive: bool, workers: usize, qps: Option<u32>) -> LimiterSet {
        LimiterSet {
            adaptive,
            pinned_workers: workers.max(1) as u32,
            qps_override: qps,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_model(&self, model: &str) -> Arc<AdaptiveRateLimiter> {
        let kind = ProviderKind::infer(model);
        let mut limiters = self.limiters.lock().unwrap();
        Arc::clone(limiters.entry(kind).or_insert_with(|| {
            let mut cfg = LimiterConfig::for_provider(kind);
            if let Some(qps) = self.qps_override {
                cfg.initial_qps = qps.clamp(cfg.min_qps, cfg.max_qps);
            }
            if !self.adaptive {
                cfg.initial_workers = self.pinned_workers;
                cfg.min_workers = cfg.initial_workers;
                cfg.max_workers = cfg.initial_workers;
                cfg.min_qps = cfg.initial_qps;
                cfg.max_qps = cfg.initial_qps;
            }
            Arc::new(AdaptiveRateLimiter::new(cfg))
        }))
    }
}

// ── Shared batch state ──────────────────────────────────────────────────

struct Shared {
    new_tasks: Mutex<VecDeque<TestTask>>,
    retry_queue: Mutex<VecDeque<TestTask>>,
    /// Worker-pool size; the threshold for preferential retry draining.
    workers: usize,
    cancelled: AtomicBool,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    succeeded: AtomicU64,
    throttle_retries: AtomicU64,
}

impl Shared {
    /// Fresh tasks go first. Once the retry queue has backed up to the
    /// worker count it drains preferentially, so throttled work cannot
    /// starve behind a long fresh queue; retries also serve as the
    /// fallback when the fresh queue is dry.
    fn pop(&self) -> Option<TestTask> {
        if self.retry_depth() >= self.workers {
            if let Some(task) = self.retry_queue.lock().unwrap().pop_front() {
                return Some(task);
            }
        }
        if let Some(task) = self.new_tasks.lock().unwrap().pop_front() {
            return Some(task);
        }
        self.retry_queue.lock().unwrap().pop_front()
    }

    fn retry_depth(&self) -> usize {
        self.retry_queue.lock().unwrap().len()
    }
}

// ── Runner ──────────────────────────────────────────────────────────────

pub struct BatchRunner {
    client: Arc<dyn LlmClient>,
    scorer: Arc<dyn QualityScorer>,
    classifier: Arc<dyn ErrorClassifier>,
    workflows: Arc<dyn WorkflowProvider>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ResultStore>,
    limiters: Arc<LimiterSet>,
    opts: RunnerOptions,
}

impl BatchRunner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        scorer: Arc<dyn QualityScorer>,
        classifier: Arc<dyn ErrorClassifier>,
        workflows: Arc<dyn WorkflowProvider>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ResultStore>,
        opts: RunnerOptions,
    ) -> BatchRunner {
        let limiters = Arc::new(LimiterSet::new(opts.adaptive, opts.workers, opts.qps));
        BatchRunner {
            client,
            scorer,
            classifier,
            workflows,
            registry,
            store,
            limiters,
            opts,
        }
    }

    pub fn limiters(&self) -> Arc<LimiterSet> {
        Arc::clone(&self.limiters)
    }

    /// Drive the whole batch. A single test failure never aborts the run;
    /// `Err` means infrastructure trouble (the shutdown flush failed).
    pub async fn run(&self, tasks: Vec<TestTask>) -> anyhow::Result<RunReport> {
        let total = tasks.len();
        let batch_deadline = self
            .opts
            .batch_timeout
            .unwrap_or_else(|| derived_batch_timeout(total));
        tracing::info!(
            total,
            workers = self.opts.workers,
            batch_timeout_secs = batch_deadline.as_secs(),
            "starting batch"
        );

        let shared = Arc::new(Shared {
            new_tasks: Mutex::new(tasks.into()),
            retry_queue: Mutex::new(VecDeque::new()),
            workers: self.opts.workers.max(1),
            cancelled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            throttle_retries: AtomicU64::new(0),
        });

        // The runner owns the store; workers only ever see this channel.
        let (tx, mut rx) = mpsc::channel::<TestRecord>(256);
        let store = Arc::clone(&self.store);
        let store_task = tokio::spawn(async move {
            let mut records = Vec::new();
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.write(record.clone()) {
                    tracing::warn!("store write failed, record dropped: {e}");
                }
                records.push(record);
            }
            records
        });

        let executor = Arc::new(Executor::new(
            Arc::clone(&self.client),
            Arc::clone(&self.scorer),
            Arc::clone(&self.registry),
        ));

        let mut pool = JoinSet::new();
        for _ in 0..self.opts.workers.max(1) {
            let ctx = WorkerContext {
                shared: Arc::clone(&shared),
                tx: tx.clone(),
                executor: Arc::clone(&executor),
                classifier: Arc::clone(&self.classifier),
                workflows: Arc::clone(&self.workflows),
                registry: Arc::clone(&self.registry),
                limiters: Arc::clone(&self.limiters),
                opts: self.opts.clone(),
                total,
            };
            pool.spawn(async move { ctx.run().await });
        }
        drop(tx);

        let drained = tokio::time::timeout(batch_deadline, async {
            while pool.join_next().await.is_some() {}
        })
        .await;
        let timed_out = drained.is_err();
        if timed_out {
            tracing::warn!("batch timeout fired, cancelling outstanding work");
            shared.cancelled.store(true, Ordering::SeqCst);
            pool.abort_all();
            while pool.join_next().await.is_some() {}
        }

        let records = store_task.await.unwrap_or_default();
        self.store.flush()?;

        let completed = shared.completed.load(Ordering::SeqCst);
        let succeeded = shared.succeeded.load(Ordering::SeqCst);
        let report = RunReport {
            total,
            completed,
            succeeded,
            failed: completed.saturating_sub(succeeded),
            throttle_retries: shared.throttle_retries.load(Ordering::SeqCst),
            cancelled: timed_out,
            records,
        };
        tracing::info!(
            completed = report.completed,
            succeeded = report.succeeded,
            failed = report.failed,
            throttle_retries = report.throttle_retries,
            "batch finished"
        );
        Ok(report)
    }
}

// ── Worker ──────────────────────────────────────────────────────────────

struct WorkerContext {
    shared: Arc<Shared>,
    tx: mpsc::Sender<TestRecord>,
    executor: Arc<Executor>,
    classifier: Arc<dyn ErrorClassifier>,
    workflows: Arc<dyn WorkflowProvider>,
    registry: Arc<ToolRegistry>,
    limiters: Arc<LimiterSet>,
    opts: RunnerOptions,
    total: usize,
}

impl WorkerContext {
    async fn run(self) {
        loop {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                break;
            }
            // Claim in-flight before popping so peers do not conclude the
            // batch is drained while we hold the last task.
            self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
            let Some(task) = self.shared.pop() else {
                let others_busy = self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) > 1;
                if others_busy {
                    // A throttled task may be requeued any moment.
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                break;
            };

            self.process(task).await;
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn process(&self, task: TestTask) {
        let limiter = self.limiters.for_model(&task.model);
        limiter.await_slot().await;

        let started = Instant::now();
        let instance = task.task_instance.clone().unwrap_or_default();

        let prepared = match self.workflows.workflow_for(task.task_type, &instance) {
            Ok(workflow) => {
                let mut rng = rand::thread_rng();
                prepare(workflow, task.prompt_type, &self.registry, &mut rng)
            }
            Err(e) => {
                limiter.record_error(&e.to_string());
                let result = synth_failure(&task, e.kind(), e.to_string(), started.elapsed());
                self.finish(&task, result).await;
                return;
            }
        };

        // Soft deadline from the task, hard ceiling from the runner; the
        // tighter one wins and both are enforced here, not in the executor.
        let soft = Duration::from_secs(task.effective_timeout_seconds());
        let deadline = soft.min(self.opts.hard_timeout);
        let outcome = tokio::time::timeout(
            deadline,
            self.executor.run(&task, &prepared, &self.shared.cancelled),
        )
        .await;

        match outcome {
            // Deadline hit: the executor future is dropped; the worker
            // moves on with a timeout record.
            Err(_elapsed) => {
                limiter.record_error("task timeout");
                let result = synth_failure(
                    &task,
                    ErrorKind::Timeout,
                    format!("task timed out after {deadline:?}"),
                    started.elapsed(),
                );
                self.finish(&task, result).await;
            }
            Ok(Err(e)) if e.is_throttle() => {
                limiter.record_throttle(&e.to_string());
                self.shared.throttle_retries.fetch_add(1, Ordering::SeqCst);
                self.shared.retry_queue.lock().unwrap().push_back(task);
                tokio::time::sleep(limiter.retry_delay()).await;
            }
            Ok(Err(ExecError::Cancelled)) => {
                // Orphaned by batch cancellation; intentionally no record.
            }
            Ok(Err(e)) => {
                limiter.record_error(&e.to_string());
                let result = synth_failure(&task, e.kind(), e.to_string(), started.elapsed());
                self.finish(&task, result).await;
            }
            Ok(Ok(result)) => {
                if result.success {
                    limiter.record_success();
                } else {
                    limiter.record_error(result.error_message.as_deref().unwrap_or("failed"));
                }
                self.finish(&task, result).await;
            }
        }
    }

    /// Build the record, classify when needed, persist the transcript if
    /// asked, hand the record to the store task, and update progress.
    async fn finish(&self, task: &TestTask, result: TestResult) {
        let mut record = TestRecord::from_parts(task, &result);

        if result.success_level != SuccessLevel::FullSuccess {
            let text = result.transcript.render();
            let classification = self.classifier.classify(&text, result.error_kind).await;
            record.ai_error_category = Some(classification.category);
            record.ai_error_reason = Some(classification.reason);
            record.ai_confidence = Some(classification.confidence);
        }

        if self.opts.save_logs {
            if let Err(e) = result.transcript.save_to(&self.opts.log_dir) {
                tracing::warn!("failed to save transcript: {e}");
            }
        }

        if self.tx.send(record).await.is_err() {
            tracing::warn!("record channel closed before send");
        }
        if result.success {
            self.shared.succeeded.fetch_add(1, Ordering::SeqCst);
        }

        let done = self.shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.opts.progress_every > 0 && done % self.opts.progress_every == 0 {
            let limiter = self.limiters.for_model(&task.model);
            let (workers, qps) = limiter.current_limits();
            tracing::info!(
                "progress: {done}/{} | success {} | limits ({workers}, {qps}) | retry depth {}",
                self.total,
                self.shared.succeeded.load(Ordering::SeqCst),
                self.shared.retry_depth(),
            );
        }
    }
}

/// Result for a task that never produced one itself (workflow failure,
/// hard timeout). Scores are zero and the transcript carries only the
/// result block.
fn synth_failure(
    task: &TestTask,
    kind: ErrorKind,
    message: String,
    elapsed: Duration,
) -> TestResult {
    let mut transcript = Transcript::begin(task, task.task_instance.as_ref(), 0);
    transcript.result = Some(TranscriptResult {
        success: false,
        success_level: SuccessLevel::Failure.to_string(),
        final_score: 0.0,
        workflow_score: 0.0,
        phase2_score: 0.0,
        execution_time_seconds: elapsed.as_secs_f64(),
        format_error_count: 0,
        error: Some(message.clone()),
        error_kind: Some(kind.as_str().to_string()),
    });
    TestResult {
        success: false,
        success_level: SuccessLevel::Failure,
        execution_time_seconds: elapsed.as_secs_f64(),
        turns: 0,
        tool_calls: Vec::new(),
        executed_tools: Vec::new(),
        workflow_score: 0.0,
        phase2_score: 0.0,
        quality_score: 0.0,
        final_score: 0.0,
        tool_coverage_rate: 0.0,
        format_error_count: 0,
        assisted: false,
        error_message: Some(message),
        error_kind: Some(kind),
        transcript,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_timeout_is_clamped() {
        assert_eq!(derived_batch_timeout(1), Duration::from_secs(3600));
        assert_eq!(derived_batch_timeout(100), Duration::from_secs(6000));
        assert_eq!(derived_batch_timeout(100_000), Duration::from_secs(14_400));
    }

    #[test]
    fn pinned_limiter_never_moves() {
        let set = LimiterSet::new(false, 8, Some(20));
        let limiter = set.for_model("gpt-4o-mini");
        for _ in 0..50 {
            limiter.record_throttle("rate limit");
            limiter.record_success();
        }
        assert_eq!(limiter.current_limits(), (8, 20));
    }

    #[test]
    fn limiters_are_shared_per_provider_kind() {
        let set = LimiterSet::new(true, 4, None);
        let a = set.for_model("deepseek-v3");
        let b = set.for_model("DeepSeek-R1");
        let c = set.for_model("qwen2.5-7b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn synth_failure_has_zeroed_scores_and_kind() {
        let task = TestTask::new(
            "m",
            crate::model::TaskType::SimpleTask,
            crate::model::PromptType::Baseline,
        );
        let result = synth_failure(
            &task,
            ErrorKind::Timeout,
            "hard timeout after 900s".into(),
            Duration::from_secs(900),
        );
        assert_eq!(result.success_level, SuccessLevel::Failure);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.transcript.render().contains("Error Kind: timeout"));
    }
}
