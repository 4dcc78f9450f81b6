//! Process-wide run counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits the current values
//! as one `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    samples_completed: AtomicU64,
    samples_failed: AtomicU64,
    samples_cancelled: AtomicU64,
    logs_finalized: AtomicU64,
    retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            samples_completed: AtomicU64::new(0),
            samples_failed: AtomicU64::new(0),
            samples_cancelled: AtomicU64::new(0),
            logs_finalized: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn inc_samples_completed(&self) {
        self.samples_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "samples_completed", "counter incremented");
    }

    pub fn inc_samples_failed(&self) {
        self.samples_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "samples_failed", "counter incremented");
    }

    pub fn inc_samples_cancelled(&self) {
        self.samples_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "samples_cancelled", "counter incremented");
    }

    pub fn inc_logs_finalized(&self) {
        self.logs_finalized.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "logs_finalized", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            samples_completed = self.samples_completed(),
            samples_failed = self.samples_failed(),
            samples_cancelled = self.samples_cancelled(),
            logs_finalized = self.logs_finalized(),
            retries = self.retries(),
        );
    }

    pub fn samples_completed(&self) -> u64 {
        self.samples_completed.load(Ordering::Relaxed)
    }

    pub fn samples_failed(&self) -> u64 {
        self.samples_failed.load(Ordering::Relaxed)
    }

    pub fn samples_cancelled(&self) -> u64 {
        self.samples_cancelled.load(Ordering::Relaxed)
    }

    pub fn logs_finalized(&self) -> u64 {
        self.logs_finalized.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.samples_completed.store(0, Ordering::Relaxed);
        self.samples_failed.store(0, Ordering::Relaxed);
        self.samples_cancelled.store(0, Ordering::Relaxed);
        self.logs_finalized.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
    }
}
