//! Adaptive per-provider rate governor.
//!
//! Holds two integers, `workers` and `qps`, inside configured bounds and
//! moves them in response to observed outcomes: throttles walk them down a
//! backoff ladder, sustained success walks them back up, and a 30 s quiet
//! window after the last throttle triggers progressive auto-recovery.
//!
//! All counters live behind one `Mutex`; `await_slot` computes its sleep
//! under the lock but sleeps outside it, at most ~20 ms per wait cycle so
//! the pool stays responsive under bursts.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::is_throttle_message;

/// Ring capacity for the trailing-outcome window.
const OUTCOME_WINDOW: usize = 100;
/// Minimum trailing success ratio required before an upscale.
const UPSCALE_SUCCESS_RATIO: f64 = 0.7;
/// Per-cycle sleep cap in `await_slot`.
const MAX_SLOT_WAIT: Duration = Duration::from_millis(20);

// ── Provider profiles ────────────────────────────────────────────────────

/// Throughput class of an upstream API, inferred from the model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    HighThroughput,
    Moderate,
    Conservative,
}

impl ProviderKind {
    /// Map a model id onto its hosting tier. Azure-hosted families tolerate
    /// very high concurrency; the qwen/scout/o1 gateway needs conservative
    /// settings; everything else starts moderate.
    pub fn infer(model: &str) -> ProviderKind {
        let m = model.to_lowercase();
        if ["deepseek", "llama-3.3", "gpt-4o-mini", "gpt-5"]
            .iter()
            .any(|f| m.contains(f))
        {
            ProviderKind::HighThroughput
        } else if ["qwen", "llama-4-scout", "o1"].iter().any(|f| m.contains(f)) {
            ProviderKind::Conservative
        } else {
            ProviderKind::Moderate
        }
    }
}

/// Tunables for one limiter. Defaults come from the provider profile;
/// individual fields may be overridden before construction.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub initial_workers: u32,
    pub initial_qps: u32,
    pub min_workers: u32,
    pub max_workers: u32,
    pub min_qps: u32,
    pub max_qps: u32,
    /// Deepest rung of the throttle backoff ladder.
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    /// Consecutive successes required before an upscale attempt.
    pub stable_streak: u32,
    pub downscale_cooldown: Duration,
    pub upscale_cooldown: Duration,
    /// Quiet time after the last throttle before auto-recovery starts.
    pub auto_recovery_after: Duration,
    /// Fixed retry delay for high-throughput providers; `None` selects the
    /// exponential schedule.
    pub fixed_retry_delay: Option<Duration>,
}

impl LimiterConfig {
    pub fn for_provider(kind: ProviderKind) -> LimiterConfig {
        let base = LimiterConfig {
            initial_workers: 5,
            initial_qps: 10,
            min_workers: 1,
            max_workers: 50,
            min_qps: 1,
            max_qps: 100,
            backoff_factor: 0.7,
            recovery_factor: 1.8,
            stable_streak: 3,
            downscale_cooldown: Duration::from_secs(5),
            upscale_cooldown: Duration::from_secs(3),
            auto_recovery_after: Duration::from_secs(30),
            fixed_retry_delay: None,
        };
        match kind {
            ProviderKind::HighThroughput => LimiterConfig {
                initial_workers: 80,
                initial_qps: 150,
                max_workers: 150,
                max_qps: 300,
                backoff_factor: 0.95,
                recovery_factor: 3.0,
                stable_streak: 1,
                fixed_retry_delay: Some(Duration::from_millis(100)),
                ..base
            },
            ProviderKind::Moderate => base,
            ProviderKind::Conservative => LimiterConfig {
                max_workers: 15,
                max_qps: 25,
                backoff_factor: 0.5,
                recovery_factor: 1.5,
                stable_streak: 10,
                ..base
            },
        }
    }
}

// ── State ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Throttle,
    Error,
}

#[derive(Debug)]
struct LimiterState {
    workers: u32,
    qps: u32,
    success_count: u64,
    throttle_count: u64,
    error_count: u64,
    consecutive_successes: u32,
    consecutive_throttles: u32,
    recent: VecDeque<Outcome>,
    last_adjustment: Instant,
    last_throttle: Instant,
    recovery_attempts: u32,
    last_request: Option<Instant>,
}

impl LimiterState {
    fn push_outcome(&mut self, outcome: Outcome) {
        if self.recent.len() == OUTCOME_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(outcome);
    }

    fn trailing_success_ratio(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let ok = self.recent.iter().filter(|o| **o == Outcome::Success).count();
        ok as f64 / self.recent.len() as f64
    }
}

/// Observability snapshot of one limiter.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub current_workers: u32,
    pub current_qps: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub throttle_count: u64,
    pub error_count: u64,
    pub success_ratio: f64,
    pub consecutive_successes: u32,
    pub consecutive_throttles: u32,
}

pub struct AdaptiveRateLimiter {
    cfg: LimiterConfig,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(cfg: LimiterConfig) -> AdaptiveRateLimiter {
        let now = Instant::now();
        let state = LimiterState {
            workers: cfg.initial_workers.clamp(cfg.min_workers, cfg.max_workers),
            qps: cfg.initial_qps.clamp(cfg.min_qps, cfg.max_qps),
            success_count: 0,
            throttle_count: 0,
            error_count: 0,
            consecutive_successes: 0,
            consecutive_throttles: 0,
            recent: VecDeque::with_capacity(OUTCOME_WINDOW),
            last_adjustment: now,
            last_throttle: now,
            recovery_attempts: 0,
            last_request: None,
        };
        AdaptiveRateLimiter { cfg, state: Mutex::new(state) }
    }

    pub fn for_provider(kind: ProviderKind) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(LimiterConfig::for_provider(kind))
    }

    /// Block until the caller may issue one request. Consumes one unit of
    /// QPS budget; sleeps at most [`MAX_SLOT_WAIT`] per cycle. Over many
    /// workers the aggregate rate converges on `qps` while no single wait
    /// grows unbounded.
    pub async fn await_slot(&self) {
        let wait = {
            let mut state = self.state.lock().unwrap();
            let qps = state.qps;
            if qps == 0 {
                state.last_request = Some(Instant::now());
                None
            } else {
                let interval = Duration::from_secs_f64(1.0 / qps as f64);
                let since_last = state
                    .last_request
                    .map(|t| t.elapsed())
                    .unwrap_or(interval);
                if since_last < interval {
                    let want = interval - since_last;
                    Some(want.min(MAX_SLOT_WAIT))
                } else {
                    state.last_request = Some(Instant::now());
                    None
                }
            }
        };
        if let Some(wait) = wait {
            if wait > Duration::from_millis(1) {
                tokio::time::sleep(wait).await;
            }
            self.state.lock().unwrap().last_request = Some(Instant::now());
        }
    }

    /// Record a successful request. May upscale once: auto-recovery when the
    /// throttle-quiet window has passed, otherwise the streak/ratio path.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.success_count += 1;
        state.push_outcome(Outcome::Success);
        state.consecutive_successes += 1;
        state.consecutive_throttles = 0;

        let below_caps = state.workers < self.cfg.max_workers || state.qps < self.cfg.max_qps;
        if state.last_throttle.elapsed() > self.cfg.auto_recovery_after && below_caps {
            self.auto_recover(&mut state);
            return;
        }

        let streak_needed = (self.cfg.stable_streak / 2).max(3);
        if state.consecutive_successes >= streak_needed {
            self.try_speed_up(&mut state);
        }
    }

    /// Record an upstream throttle and walk the backoff ladder.
    pub fn record_throttle(&self, msg: &str) {
        let mut state = self.state.lock().unwrap();
        state.throttle_count += 1;
        state.push_outcome(Outcome::Throttle);
        state.consecutive_throttles += 1;
        state.consecutive_successes = 0;
        state.last_throttle = Instant::now();
        state.recovery_attempts = 0;
        self.slow_down(&mut state);
        tracing::warn!(
            workers = state.workers,
            qps = state.qps,
            consecutive = state.consecutive_throttles,
            "throttle observed: {msg}"
        );
    }

    /// Record a non-throttle error. Counted, never adjusts limits.
    pub fn record_error(&self, _msg: &str) {
        let mut state = self.state.lock().unwrap();
        state.error_count += 1;
        state.push_outcome(Outcome::Error);
    }

    /// True iff `err_msg` matches the throttle vocabulary. Matching also
    /// records the throttle, so callers can branch on the return value and
    /// requeue without a second call.
    pub fn should_retry(&self, err_msg: &str) -> bool {
        if is_throttle_message(err_msg) {
            self.record_throttle(err_msg);
            true
        } else {
            false
        }
    }

    /// Backoff a caller should apply before retrying a throttled request.
    pub fn retry_delay(&self) -> Duration {
        if let Some(fixed) = self.cfg.fixed_retry_delay {
            return fixed;
        }
        let state = self.state.lock().unwrap();
        let secs = 0.2 * 1.2_f64.powi(state.consecutive_throttles as i32);
        Duration::from_secs_f64(secs.min(5.0))
    }

    pub fn current_limits(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.workers, state.qps)
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock().unwrap();
        let total = state.success_count + state.throttle_count + state.error_count;
        LimiterStats {
            current_workers: state.workers,
            current_qps: state.qps,
            total_requests: total,
            success_count: state.success_count,
            throttle_count: state.throttle_count,
            error_count: state.error_count,
            success_ratio: if total == 0 {
                1.0
            } else {
                state.success_count as f64 / total as f64
            },
            consecutive_successes: state.consecutive_successes,
            consecutive_throttles: state.consecutive_throttles,
        }
    }

    // ── Adjustment internals (state lock held) ──────────────────────────

    fn slow_down(&self, state: &mut LimiterState) {
        if state.last_adjustment.elapsed() < self.cfg.downscale_cooldown {
            return;
        }
        // Ladder indexed by consecutive throttles: gentle first, profile
        // floor from the fourth hit on.
        let factor = match state.consecutive_throttles {
            0 | 1 => 0.9,
            2 => 0.75,
            3 => 0.6,
            _ => self.cfg.backoff_factor,
        };
        let (old_workers, old_qps) = (state.workers, state.qps);
        state.workers = (((state.workers as f64) * factor) as u32).max(self.cfg.min_workers);
        state.qps = (((state.qps as f64) * factor) as u32).max(self.cfg.min_qps);
        state.last_adjustment = Instant::now();
        state.consecutive_successes = 0;
        tracing::info!(
            "slowing down: workers {old_workers}->{}, qps {old_qps}->{}",
            state.workers,
            state.qps
        );
    }

    fn try_speed_up(&self, state: &mut LimiterState) {
        if state.last_adjustment.elapsed() < self.cfg.upscale_cooldown {
            return;
        }
        if state.trailing_success_ratio() < UPSCALE_SUCCESS_RATIO {
            return;
        }
        let (old_workers, old_qps) = (state.workers, state.qps);
        state.workers =
            (((state.workers as f64) * self.cfg.recovery_factor) as u32).min(self.cfg.max_workers);
        state.qps = (((state.qps as f64) * self.cfg.recovery_factor) as u32).min(self.cfg.max_qps);
        state.last_adjustment = Instant::now();
        state.consecutive_successes = 0;
        tracing::info!(
            "speeding up: workers {old_workers}->{}, qps {old_qps}->{}",
            state.workers,
            state.qps
        );
    }

    /// Progressive recovery after a throttle-quiet window: conservative for
    /// the first two attempts, then steeper until the caps are reached.
    fn auto_recover(&self, state: &mut LimiterState) {
        state.recovery_attempts += 1;
        let factor = if state.recovery_attempts <= 2 { 1.2 } else { 1.5 };
        let (old_workers, old_qps) = (state.workers, state.qps);
        state.workers = (((state.workers as f64) * factor).max(state.workers as f64 + 1.0) as u32)
            .min(self.cfg.max_workers);
        state.qps = (((state.qps as f64) * factor).max(state.qps as f64 + 1.0) as u32)
            .min(self.cfg.max_qps);
        state.last_adjustment = Instant::now();
        state.consecutive_successes = 0;
        tracing::info!(
            attempt = state.recovery_attempts,
            "auto-recovering: workers {old_workers}->{}, qps {old_qps}->{}",
            state.workers,
            state.qps
        );
    }
}
