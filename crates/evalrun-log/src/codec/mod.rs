//! Format codecs.
//!
//! A codec turns [`EvalLog`] values into bytes for one [`LogFormat`] and back.
//! Codecs are stateless; incremental writers keep their state in the
//! recorder and call `log_start` / `log_samples` / `log_finish` in order.

mod eval;
mod json;

use async_trait::async_trait;

use crate::error::LogResult;
use crate::format::LogFormat;
use crate::fs::LogFs;
use crate::model::{EvalLog, EvalSample, LogStart, SampleId, SampleSummary};

pub use eval::EvalCodec;
pub use json::JsonCodec;

#[async_trait]
pub trait LogCodec: Send + Sync {
    fn format(&self) -> LogFormat;

    /// Whether `read_log_sample` can address a sample without scanning the body.
    fn supports_random_access(&self) -> bool;

    /// Read a log. With `header_only` the sample body is never deserialized.
    async fn read_log(&self, fs: &dyn LogFs, location: &str, header_only: bool)
        -> LogResult<EvalLog>;

    /// Read exactly one (id, epoch) pair.
    async fn read_log_sample(
        &self,
        fs: &dyn LogFs,
        location: &str,
        id: &SampleId,
        epoch: u32,
    ) -> LogResult<EvalSample>;

    /// Write a complete log in one shot, replacing anything at `location`.
    async fn write_log(&self, fs: &dyn LogFs, location: &str, log: &EvalLog) -> LogResult<()>;

    /// Create the log with its start record.
    async fn log_start(&self, fs: &dyn LogFs, location: &str, start: &LogStart) -> LogResult<()>;

    /// Persist one flushed batch. `flush` numbers batches from 1.
    async fn log_samples(
        &self,
        fs: &dyn LogFs,
        location: &str,
        flush: u32,
        samples: &[EvalSample],
        summaries: &[SampleSummary],
    ) -> LogResult<()>;

    /// Write the final header. `finished` carries no samples.
    async fn log_finish(
        &self,
        fs: &dyn LogFs,
        location: &str,
        finished: &EvalLog,
        summaries: &[SampleSummary],
    ) -> LogResult<()>;
}

static EVAL_CODEC: EvalCodec = EvalCodec;
static JSON_CODEC: JsonCodec = JsonCodec;

/// Codec for `format`.
pub fn codec_for(format: LogFormat) -> &'static dyn LogCodec {
    match format {
        LogFormat::Eval => &EVAL_CODEC,
        LogFormat::Json => &JSON_CODEC,
    }
}

/// Header-only view of a log started but not yet finished.
pub(crate) fn started_log(start: LogStart) -> EvalLog {
    let stats = crate::model::EvalStats {
        started_at: Some(start.eval.created),
        ..Default::default()
    };
    EvalLog {
        version: start.version,
        status: crate::model::EvalStatus::Started,
        eval: start.eval,
        plan: start.plan,
        results: None,
        stats,
        error: None,
        samples: None,
        reductions: None,
        logging: Vec::new(),
        location: String::new(),
    }
}
