//! Read/write API over locations.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::attachments::resolve_sample_attachments;
use crate::codec::codec_for;
use crate::error::{LogError, LogResult};
use crate::format::FormatChoice;
use crate::fs::Storage;
use crate::model::{EvalLog, EvalSample, EvalStatus, SampleId};

/// Options for reading logs and samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Skip the sample body entirely.
    pub header_only: bool,
    /// Rehydrate `attachment://` references.
    pub resolve_attachments: bool,
    pub format: FormatChoice,
}

impl ReadOptions {
    pub fn header_only() -> Self {
        Self {
            header_only: true,
            ..Default::default()
        }
    }
}

/// Fill in the sample-id index from the body when the header predates it.
fn backfill_sample_ids(log: &mut EvalLog) -> bool {
    if log.eval.dataset.sample_ids.is_some() {
        return false;
    }
    match log.body_sample_ids() {
        Some(ids) => {
            log.eval.dataset.sample_ids = Some(ids);
            true
        }
        None => false,
    }
}

fn resolve_all(samples: Vec<EvalSample>) -> LogResult<Vec<EvalSample>> {
    samples.into_iter().map(resolve_sample_attachments).collect()
}

pub async fn read_eval_log(
    storage: &Storage,
    location: &str,
    options: &ReadOptions,
) -> LogResult<EvalLog> {
    let fs = storage.resolve(location);
    let codec = codec_for(options.format.resolve(location));
    let mut log = codec
        .read_log(fs.as_ref(), location, options.header_only)
        .await?;
    log.location = location.to_string();

    if !options.header_only {
        if backfill_sample_ids(&mut log) {
            debug!(location, "reconstructed sample id index from body");
        }
        if options.resolve_attachments {
            if let Some(samples) = log.samples.take() {
                log.samples = Some(resolve_all(samples)?);
            }
        }
    }
    Ok(log)
}

/// Header-only reads of many logs, in input order.
pub async fn read_eval_log_headers(
    storage: &Storage,
    locations: &[String],
) -> LogResult<Vec<EvalLog>> {
    let handles: Vec<_> = locations
        .iter()
        .map(|location| {
            let storage = storage.clone();
            let location = location.clone();
            tokio::spawn(async move {
                read_eval_log(&storage, &location, &ReadOptions::header_only()).await
            })
        })
        .collect();

    let mut headers = Vec::with_capacity(handles.len());
    for handle in handles {
        headers.push(handle.await??);
    }
    Ok(headers)
}

/// Read one (id, epoch) pair without loading the rest of the body.
pub async fn read_eval_log_sample(
    storage: &Storage,
    location: &str,
    id: &SampleId,
    epoch: u32,
    options: &ReadOptions,
) -> LogResult<EvalSample> {
    let fs = storage.resolve(location);
    let codec = codec_for(options.format.resolve(location));
    let sample = codec
        .read_log_sample(fs.as_ref(), location, id, epoch)
        .await?;
    if options.resolve_attachments {
        resolve_sample_attachments(sample)
    } else {
        Ok(sample)
    }
}

/// Pulls samples one at a time in sample-id index order.
#[derive(Debug)]
pub struct SampleReader {
    storage: Storage,
    location: String,
    options: ReadOptions,
    pending: VecDeque<(SampleId, u32)>,
    all_samples_required: bool,
}

impl SampleReader {
    /// Pairs not yet read.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Next sample, or `None` when exhausted. Absent pairs are skipped
    /// unless every sample is required.
    pub async fn next(&mut self) -> Option<LogResult<EvalSample>> {
        while let Some((id, epoch)) = self.pending.pop_front() {
            match read_eval_log_sample(&self.storage, &self.location, &id, epoch, &self.options)
                .await
            {
                Err(LogError::SampleNotFound { .. }) if !self.all_samples_required => {
                    debug!(location = %self.location, %id, epoch, "skipping absent sample");
                }
                result => return Some(result),
            }
        }
        None
    }

    /// Drain the reader.
    pub async fn collect(mut self) -> LogResult<Vec<EvalSample>> {
        let mut samples = Vec::with_capacity(self.remaining());
        while let Some(sample) = self.next().await {
            samples.push(sample?);
        }
        Ok(samples)
    }
}

/// Stream the samples of a log using its sample-id index.
///
/// Requires the index. With `all_samples_required` the log must have
/// finished successfully and every listed pair must be present.
pub async fn read_eval_log_samples(
    storage: &Storage,
    location: &str,
    all_samples_required: bool,
    options: &ReadOptions,
) -> LogResult<SampleReader> {
    let header = read_eval_log(
        storage,
        location,
        &ReadOptions {
            header_only: true,
            ..*options
        },
    )
    .await?;

    if all_samples_required && header.status != EvalStatus::Success {
        return Err(LogError::SamplesUnavailable {
            location: location.to_string(),
            reason: format!("log status is {}", header.status),
        });
    }
    let ids = header
        .eval
        .dataset
        .sample_ids
        .ok_or_else(|| LogError::SamplesUnavailable {
            location: location.to_string(),
            reason: "log has no sample id index".to_string(),
        })?;

    let epochs = header.eval.config.epochs_or_default();
    let pending = ids
        .into_iter()
        .flat_map(|id| (1..=epochs).map(move |epoch| (id.clone(), epoch)))
        .collect();

    Ok(SampleReader {
        storage: storage.clone(),
        location: location.to_string(),
        options: ReadOptions {
            header_only: false,
            ..*options
        },
        pending,
        all_samples_required,
    })
}

/// Write `log` whole to `location` (or its own location). Returns the location written.
pub async fn write_eval_log(
    storage: &Storage,
    log: &EvalLog,
    location: Option<&str>,
    format: FormatChoice,
) -> LogResult<String> {
    let location = location.unwrap_or(log.location.as_str());
    if location.is_empty() {
        return Err(LogError::InvalidLog {
            location: String::new(),
            reason: "no location to write to".to_string(),
        });
    }
    let fs = storage.resolve(location);
    let codec = codec_for(format.resolve(location));
    codec.write_log(fs.as_ref(), location, log).await?;
    info!(location, status = %log.status, "wrote eval log");
    Ok(location.to_string())
}

/// Persist a reconstructed sample-id index for a log that lacks one.
///
/// Returns true when the log was rewritten.
pub async fn ensure_sample_ids(
    storage: &Storage,
    location: &str,
    format: FormatChoice,
) -> LogResult<bool> {
    let options = ReadOptions {
        header_only: true,
        resolve_attachments: false,
        format,
    };
    let header = read_eval_log(storage, location, &options).await?;
    if header.eval.dataset.sample_ids.is_some() {
        return Ok(false);
    }
    let log = read_eval_log(
        storage,
        location,
        &ReadOptions {
            header_only: false,
            ..options
        },
    )
    .await?;
    if log.eval.dataset.sample_ids.is_none() {
        return Ok(false);
    }
    write_eval_log(storage, &log, Some(location), format).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::log::fixtures::spec;
    use crate::model::EvalPlan;

    #[test]
    fn backfill_uses_body_order() {
        let mut log = EvalLog::started(spec("t"), EvalPlan::default());
        log.samples = Some(vec![
            EvalSample::new("b", 1, ""),
            EvalSample::new("a", 1, ""),
            EvalSample::new("b", 2, ""),
        ]);
        assert!(backfill_sample_ids(&mut log));
        assert_eq!(
            log.eval.dataset.sample_ids,
            Some(vec![SampleId::from("b"), SampleId::from("a")])
        );
        assert!(!backfill_sample_ids(&mut log));
    }

    #[tokio::test]
    async fn write_without_location_fails() {
        let log = EvalLog::started(spec("t"), EvalPlan::default());
        let err = write_eval_log(&Storage::local(), &log, None, FormatChoice::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::InvalidLog { .. }));
    }
}
