//! Per-sample execution context.
//!
//! Solvers receive a [`SampleContext`] by reference. It carries the
//! interrupt signal, the sample's limits and the latest recorded state, and
//! hands out subprocess slots. Nothing here is process-global.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evalrun_log::{EvalConfig, LimitKind, SampleId, SampleLimitExceeded};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RunError, RunResult};
use crate::governor::{ConcurrencyGovernor, Lease, PoolKey};
use crate::solver::TaskState;

/// Limits that end a single sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleLimits {
    pub message: Option<u64>,
    pub token: Option<u64>,
    /// Wall-clock time.
    pub time: Option<Duration>,
    /// Time spent working, excluding waits for shared resources.
    pub working: Option<Duration>,
}

impl SampleLimits {
    pub fn from_config(config: &EvalConfig) -> Self {
        Self {
            message: config.message_limit,
            token: config.token_limit,
            time: config.time_limit.map(Duration::from_secs),
            working: config.working_limit.map(Duration::from_secs),
        }
    }
}

fn exceeded(kind: LimitKind, limit: f64) -> RunError {
    RunError::LimitExceeded(SampleLimitExceeded { kind, limit })
}

pub struct SampleContext {
    sample_id: SampleId,
    epoch: u32,
    cancel: CancellationToken,
    limits: SampleLimits,
    started: Instant,
    waiting: Mutex<Duration>,
    latest: Mutex<Option<TaskState>>,
    governor: Arc<ConcurrencyGovernor>,
}

impl SampleContext {
    pub fn new(
        sample_id: SampleId,
        epoch: u32,
        cancel: CancellationToken,
        limits: SampleLimits,
        governor: Arc<ConcurrencyGovernor>,
    ) -> Self {
        Self {
            sample_id,
            epoch,
            cancel,
            limits,
            started: Instant::now(),
            waiting: Mutex::new(Duration::ZERO),
            latest: Mutex::new(None),
            governor,
        }
    }

    pub fn sample_id(&self) -> &SampleId {
        &self.sample_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn limits(&self) -> &SampleLimits {
        &self.limits
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Interrupted)` once the interrupt signal is set.
    pub fn check_interrupt(&self) -> RunResult<()> {
        if self.is_interrupted() {
            Err(RunError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Check `state` after a step. A limit is exceeded only once the count
    /// goes past it.
    pub fn check_limits(&self, state: &TaskState) -> RunResult<()> {
        self.check_counts(state, |count, limit| count > limit)
    }

    /// Check `state` before a generate. Reaching a limit already forbids
    /// another model call.
    pub fn check_generate_limits(&self, state: &TaskState) -> RunResult<()> {
        self.check_counts(state, |count, limit| count >= limit)
    }

    fn check_counts(&self, state: &TaskState, over: impl Fn(u64, u64) -> bool) -> RunResult<()> {
        if let Some(limit) = self.limits.message {
            if over(state.messages.len() as u64, limit) {
                return Err(exceeded(LimitKind::Message, limit as f64));
            }
        }
        if let Some(limit) = self.limits.token {
            if over(state.usage.total_tokens, limit) {
                return Err(exceeded(LimitKind::Token, limit as f64));
            }
        }
        if let Some(limit) = self.limits.working {
            if self.working_time() > limit {
                return Err(exceeded(LimitKind::Working, limit.as_secs_f64()));
            }
        }
        Ok(())
    }

    pub fn record_state(&self, state: &TaskState) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
    }

    /// Last state recorded by a solver step.
    pub fn latest_state(&self) -> Option<TaskState> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn total_time(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn working_time(&self) -> Duration {
        let waiting = *self.waiting.lock().unwrap_or_else(|e| e.into_inner());
        self.total_time().saturating_sub(waiting)
    }

    /// Await `fut`, counting the time as waiting rather than working.
    pub async fn waiting<F: Future>(&self, fut: F) -> F::Output {
        let start = Instant::now();
        let output = fut.await;
        *self.waiting.lock().unwrap_or_else(|e| e.into_inner()) += start.elapsed();
        output
    }

    /// Hold a subprocess slot while running an external process.
    pub async fn subprocess(&self) -> RunResult<Lease> {
        self.check_interrupt()?;
        self.waiting(self.governor.acquire(&PoolKey::Subprocesses))
            .await
    }
}
