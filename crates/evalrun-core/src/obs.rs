//! Structured lifecycle events for runs, tasks and samples.
//!
//! Events are emitted at `info!` with an `event` field; filter with
//! `RUST_LOG`. Run futures are instrumented with the span from [`RunSpan`]
//! so every event inside carries the `run_id`.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, Instrument, Span};

/// Run-scoped span.
///
/// ```ignore
/// let span = RunSpan::new("run-123");
/// span.in_span(async { /* ... */ }).await;
/// ```
pub struct RunSpan {
    span: Span,
}

impl RunSpan {
    pub fn new(run_id: &str) -> Self {
        Self {
            span: tracing::info_span!("evalrun.run", run_id = %run_id),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Attach the span to an async block.
    pub fn in_span<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

pub fn emit_run_started(run_id: &str, tasks: usize, models: usize) {
    info!(event = "run.started", run_id = %run_id, tasks = tasks, models = models);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, logs: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        logs = logs,
        success = success,
    );
}

/// Emit event: a cancelled result stopped the remaining sequences.
pub fn emit_run_cancelled(run_id: &str, sequence: usize) {
    tracing::warn!(event = "run.cancelled", run_id = %run_id, sequence = sequence);
}

pub fn emit_task_started(task: &str, task_id: &str, model: &str, samples: usize) {
    info!(
        event = "task.started",
        task = %task,
        task_id = %task_id,
        model = %model,
        samples = samples,
    );
}

pub fn emit_task_finished(task_id: &str, status: &str, completed: usize, total: usize) {
    info!(
        event = "task.finished",
        task_id = %task_id,
        status = %status,
        completed = completed,
        total = total,
    );
}

pub fn emit_sample_completed(task_id: &str, sample_id: &str, epoch: u32, error: bool) {
    tracing::debug!(
        event = "sample.completed",
        task_id = %task_id,
        sample_id = %sample_id,
        epoch = epoch,
        error = error,
    );
}

pub fn emit_log_finalized(location: &str, status: &str) {
    info!(event = "log.finalized", location = %location, status = %status);
}
