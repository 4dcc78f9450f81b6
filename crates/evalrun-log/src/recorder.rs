//! Incremental log writer.
//!
//! A run opens one log per task with [`LogRecorder::log_init`], writes the
//! start record, then feeds completed samples as they arrive. Samples are
//! buffered and flushed in batches; the final header is written by
//! [`LogRecorder::log_finish`]. All writes to one location are serialized
//! behind a per-location lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::attachments::condense_sample;
use crate::codec::codec_for;
use crate::error::{LogError, LogResult};
use crate::filename::log_file_name;
use crate::format::{FormatChoice, LogFormat};
use crate::fs::{join_location, Storage};
use crate::model::{
    EvalError, EvalLog, EvalPlan, EvalResults, EvalSample, EvalSampleReductions, EvalSpec,
    EvalStats, EvalStatus, LogStart, LoggingMessage, SampleId, SampleSummary, LOG_SCHEMA_VERSION,
};

/// Samples per flush for local locations.
pub const DEFAULT_LOCAL_BUFFER: usize = 10;
/// Samples per flush for remote locations.
pub const DEFAULT_REMOTE_BUFFER: usize = 100;

/// Final state handed to [`LogRecorder::log_finish`].
#[derive(Debug, Clone)]
pub struct FinishLog {
    pub status: EvalStatus,
    pub stats: EvalStats,
    pub results: Option<EvalResults>,
    pub reductions: Option<Vec<EvalSampleReductions>>,
    pub error: Option<EvalError>,
    pub logging: Vec<LoggingMessage>,
}

impl FinishLog {
    pub fn new(status: EvalStatus, stats: EvalStats) -> Self {
        Self {
            status,
            stats,
            results: None,
            reductions: None,
            error: None,
            logging: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct OpenLog {
    format: LogFormat,
    eval: EvalSpec,
    plan: Option<EvalPlan>,
    buffer_size: usize,
    log_samples: bool,
    log_images: bool,
    pending: Vec<EvalSample>,
    pending_summaries: Vec<SampleSummary>,
    summaries: Vec<SampleSummary>,
    seen: HashSet<(SampleId, u32)>,
    flushes: u32,
}

/// Buffered, format-pluggable log writer.
#[derive(Debug)]
pub struct LogRecorder {
    storage: Storage,
    log_dir: String,
    format: FormatChoice,
    buffer: Option<usize>,
    open: Mutex<HashMap<String, Arc<AsyncMutex<OpenLog>>>>,
}

impl LogRecorder {
    pub fn new(storage: Storage, log_dir: impl Into<String>, format: FormatChoice) -> Self {
        Self {
            storage,
            log_dir: log_dir.into(),
            format,
            buffer: None,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Override the flush batch size for every log this recorder opens.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = Some(buffer.max(1));
        self
    }

    pub fn log_dir(&self) -> &str {
        &self.log_dir
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Whether the log directory accepts writes.
    pub async fn is_writeable(&self) -> bool {
        self.storage
            .resolve(&self.log_dir)
            .is_writeable(&self.log_dir)
            .await
    }

    /// Batch size that applies to `location`.
    pub fn buffer_size(&self, location: &str, eval: &EvalSpec) -> usize {
        self.buffer
            .or(eval.config.log_buffer)
            .unwrap_or_else(|| {
                if self.storage.resolve(location).is_remote() {
                    DEFAULT_REMOTE_BUFFER
                } else {
                    DEFAULT_LOCAL_BUFFER
                }
            })
            .max(1)
    }

    fn entry(&self, location: &str) -> LogResult<Arc<AsyncMutex<OpenLog>>> {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(location)
            .cloned()
            .ok_or_else(|| LogError::NotOpen(location.to_string()))
    }

    /// Register a new log and return its location.
    ///
    /// Without an explicit location the log is named by convention inside
    /// the recorder's directory.
    pub fn log_init(&self, eval: EvalSpec, location: Option<String>) -> LogResult<String> {
        let location = match location {
            Some(location) => location,
            None => {
                let format = match self.format {
                    FormatChoice::Fixed(format) => format,
                    FormatChoice::Auto => LogFormat::default(),
                };
                let name = log_file_name(&eval.task, &eval.task_id, eval.created, format);
                join_location(&self.log_dir, &name)
            }
        };
        let format = self.format.resolve(&location);
        let log = OpenLog {
            format,
            buffer_size: self.buffer_size(&location, &eval),
            log_samples: eval.config.log_samples_or_default(),
            log_images: eval.config.log_images.unwrap_or(true),
            eval,
            plan: None,
            pending: Vec::new(),
            pending_summaries: Vec::new(),
            summaries: Vec::new(),
            seen: HashSet::new(),
            flushes: 0,
        };

        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if open.contains_key(&location) {
            return Err(LogError::AlreadyOpen(location));
        }
        open.insert(location.clone(), Arc::new(AsyncMutex::new(log)));
        debug!(location = %location, %format, "log initialised");
        Ok(location)
    }

    /// Write the start record.
    #[instrument(skip(self, plan))]
    pub async fn log_start(&self, location: &str, plan: EvalPlan) -> LogResult<()> {
        let entry = self.entry(location)?;
        let mut log = entry.lock().await;
        let start = LogStart {
            version: LOG_SCHEMA_VERSION,
            eval: log.eval.clone(),
            plan: plan.clone(),
        };
        let fs = self.storage.resolve(location);
        codec_for(log.format)
            .log_start(fs.as_ref(), location, &start)
            .await?;
        log.plan = Some(plan);
        Ok(())
    }

    /// Buffer one completed sample, flushing when the batch is full.
    ///
    /// A second sample for an (id, epoch) pair already recorded is ignored.
    pub async fn log_sample(&self, location: &str, sample: EvalSample) -> LogResult<()> {
        let entry = self.entry(location)?;
        let mut log = entry.lock().await;
        if !log.seen.insert((sample.id.clone(), sample.epoch)) {
            warn!(location, id = %sample.id, epoch = sample.epoch, "duplicate sample ignored");
            return Ok(());
        }
        log.pending_summaries.push(sample.summary());
        if log.log_samples {
            let sample = condense_sample(sample, log.log_images);
            log.pending.push(sample);
        }
        if log.pending_summaries.len() >= log.buffer_size {
            self.flush_locked(location, &mut log).await?;
        }
        Ok(())
    }

    /// Flush buffered samples now.
    pub async fn flush(&self, location: &str) -> LogResult<()> {
        let entry = self.entry(location)?;
        let mut log = entry.lock().await;
        self.flush_locked(location, &mut log).await
    }

    async fn flush_locked(&self, location: &str, log: &mut OpenLog) -> LogResult<()> {
        if log.pending_summaries.is_empty() {
            return Ok(());
        }
        let flush = log.flushes + 1;
        let fs = self.storage.resolve(location);
        codec_for(log.format)
            .log_samples(
                fs.as_ref(),
                location,
                flush,
                &log.pending,
                &log.pending_summaries,
            )
            .await?;
        log.flushes = flush;
        log.pending.clear();
        let summaries = std::mem::take(&mut log.pending_summaries);
        debug!(location, flush, samples = summaries.len(), "flushed samples");
        log.summaries.extend(summaries);
        Ok(())
    }

    /// Flush, write the final header and close the log.
    ///
    /// Returns the header as written.
    #[instrument(skip(self, finish), fields(status = %finish.status))]
    pub async fn log_finish(&self, location: &str, finish: FinishLog) -> LogResult<EvalLog> {
        let entry = self.entry(location)?;
        let mut log = entry.lock().await;
        self.flush_locked(location, &mut log).await?;

        let finished = EvalLog {
            version: LOG_SCHEMA_VERSION,
            status: finish.status,
            eval: log.eval.clone(),
            plan: log.plan.clone().unwrap_or_default(),
            results: finish.results,
            stats: finish.stats,
            error: finish.error,
            samples: None,
            reductions: finish.reductions,
            logging: finish.logging,
            location: location.to_string(),
        };
        let fs = self.storage.resolve(location);
        codec_for(log.format)
            .log_finish(fs.as_ref(), location, &finished, &log.summaries)
            .await?;

        drop(log);
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(location);
        info!(location, status = %finished.status, "log finished");
        Ok(finished.header())
    }

    /// Locations currently open.
    pub fn open_locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        locations.sort();
        locations
    }
}
