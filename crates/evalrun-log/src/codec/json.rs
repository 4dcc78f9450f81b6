//! Interchange `json` format: one pretty-printed document per log.
//!
//! There is no index, so `read_log_sample` scans the body.

use async_trait::async_trait;
use serde::Deserialize;

use super::{started_log, LogCodec};
use crate::error::{LogError, LogResult};
use crate::format::LogFormat;
use crate::fs::LogFs;
use crate::model::{
    EvalError, EvalLog, EvalPlan, EvalResults, EvalSample, EvalSpec, EvalStats, EvalStatus,
    LogStart, SampleId, SampleSummary, LOG_SCHEMA_VERSION,
};

/// Header fields of the document. Body keys are skipped by the parser.
#[derive(Deserialize)]
struct HeaderDoc {
    #[serde(default)]
    version: Option<u32>,
    status: EvalStatus,
    eval: EvalSpec,
    #[serde(default)]
    plan: EvalPlan,
    #[serde(default)]
    results: Option<EvalResults>,
    #[serde(default)]
    stats: EvalStats,
    #[serde(default)]
    error: Option<EvalError>,
}

impl From<HeaderDoc> for EvalLog {
    fn from(doc: HeaderDoc) -> Self {
        EvalLog {
            version: doc.version.unwrap_or(LOG_SCHEMA_VERSION),
            status: doc.status,
            eval: doc.eval,
            plan: doc.plan,
            results: doc.results,
            stats: doc.stats,
            error: doc.error,
            samples: None,
            reductions: None,
            logging: Vec::new(),
            location: String::new(),
        }
    }
}

#[derive(Deserialize)]
struct SamplesDoc {
    #[serde(default)]
    samples: Vec<EvalSample>,
}

fn invalid(location: &str, err: serde_json::Error) -> LogError {
    LogError::InvalidLog {
        location: location.to_string(),
        reason: err.to_string(),
    }
}

async fn read_document(fs: &dyn LogFs, location: &str) -> LogResult<EvalLog> {
    let bytes = fs.read(location).await?;
    serde_json::from_slice(&bytes).map_err(|e| invalid(location, e))
}

async fn write_document(fs: &dyn LogFs, location: &str, log: &EvalLog) -> LogResult<()> {
    let bytes = serde_json::to_vec_pretty(log)?;
    fs.write(location, &bytes).await
}

/// Codec for the single-document JSON format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[async_trait]
impl LogCodec for JsonCodec {
    fn format(&self) -> LogFormat {
        LogFormat::Json
    }

    fn supports_random_access(&self) -> bool {
        false
    }

    async fn read_log(
        &self,
        fs: &dyn LogFs,
        location: &str,
        header_only: bool,
    ) -> LogResult<EvalLog> {
        if !header_only {
            return read_document(fs, location).await;
        }
        let bytes = fs.read(location).await?;
        let doc: HeaderDoc = serde_json::from_slice(&bytes).map_err(|e| invalid(location, e))?;
        Ok(doc.into())
    }

    async fn read_log_sample(
        &self,
        fs: &dyn LogFs,
        location: &str,
        id: &SampleId,
        epoch: u32,
    ) -> LogResult<EvalSample> {
        let bytes = fs.read(location).await?;
        let doc: SamplesDoc = serde_json::from_slice(&bytes).map_err(|e| invalid(location, e))?;
        doc.samples
            .into_iter()
            .find(|s| &s.id == id && s.epoch == epoch)
            .ok_or_else(|| LogError::SampleNotFound {
                id: id.clone(),
                epoch,
                location: location.to_string(),
            })
    }

    async fn write_log(&self, fs: &dyn LogFs, location: &str, log: &EvalLog) -> LogResult<()> {
        write_document(fs, location, log).await
    }

    async fn log_start(&self, fs: &dyn LogFs, location: &str, start: &LogStart) -> LogResult<()> {
        write_document(fs, location, &started_log(start.clone())).await
    }

    async fn log_samples(
        &self,
        fs: &dyn LogFs,
        location: &str,
        _flush: u32,
        samples: &[EvalSample],
        _summaries: &[SampleSummary],
    ) -> LogResult<()> {
        let mut log = read_document(fs, location).await?;
        log.samples
            .get_or_insert_with(Vec::new)
            .extend(samples.iter().cloned());
        write_document(fs, location, &log).await
    }

    async fn log_finish(
        &self,
        fs: &dyn LogFs,
        location: &str,
        finished: &EvalLog,
        _summaries: &[SampleSummary],
    ) -> LogResult<()> {
        let existing = read_document(fs, location).await?;
        let mut log = finished.clone();
        log.samples = existing.samples;
        log.logging = existing.logging;
        log.logging.extend(finished.logging.iter().cloned());
        write_document(fs, location, &log).await
    }
}
