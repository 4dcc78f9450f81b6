//! Native `eval` format: a zip archive whose central directory is the sample index.
//!
//! Layout:
//! - `_journal/start.json`: spec and plan, written when the log is started
//! - `_journal/summaries/<n>.json`: summaries of the n-th flushed batch
//! - `samples/<id>_epoch_<epoch>.json`: one entry per sample
//! - `header.json`, `summaries.json`, `reductions.json`, `logging.json`: written at finish
//!
//! Appends add entries and rewrite only the central directory.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{started_log, LogCodec};
use crate::error::{LogError, LogResult};
use crate::format::LogFormat;
use crate::fs::LogFs;
use crate::model::{
    EvalLog, EvalSample, EvalSampleReductions, LogStart, LoggingMessage, SampleId, SampleSummary,
};

const START_ENTRY: &str = "_journal/start.json";
const SUMMARY_DIR: &str = "_journal/summaries";
const SAMPLES_DIR: &str = "samples/";
const HEADER_ENTRY: &str = "header.json";
const SUMMARIES_ENTRY: &str = "summaries.json";
const REDUCTIONS_ENTRY: &str = "reductions.json";
const LOGGING_ENTRY: &str = "logging.json";

/// Archive entry holding one (id, epoch) sample.
pub fn sample_entry_name(id: &SampleId, epoch: u32) -> String {
    format!("{SAMPLES_DIR}{id}_epoch_{epoch}.json")
}

trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

type Archive = ZipArchive<Box<dyn ReadSeek>>;
type Entries = Vec<(String, Vec<u8>)>;

enum Source {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

fn io_not_found(location: &str, err: std::io::Error) -> LogError {
    if err.kind() == std::io::ErrorKind::NotFound {
        LogError::NotFound {
            location: location.to_string(),
        }
    } else {
        LogError::Io(err)
    }
}

fn invalid(location: &str, reason: impl ToString) -> LogError {
    LogError::InvalidLog {
        location: location.to_string(),
        reason: reason.to_string(),
    }
}

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn open(source: Source, location: &str) -> LogResult<Archive> {
    let reader: Box<dyn ReadSeek> = match source {
        Source::Path(path) => {
            Box::new(File::open(&path).map_err(|e| io_not_found(location, e))?)
        }
        Source::Bytes(bytes) => Box::new(Cursor::new(bytes)),
    };
    ZipArchive::new(reader).map_err(|e| invalid(location, e))
}

/// Run `f` against the opened archive on the blocking pool.
async fn with_archive<T, F>(fs: &dyn LogFs, location: &str, f: F) -> LogResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Archive, &str) -> LogResult<T> + Send + 'static,
{
    let source = match fs.local_path(location) {
        Some(path) => Source::Path(path),
        None => Source::Bytes(fs.read(location).await?),
    };
    let location = location.to_string();
    tokio::task::spawn_blocking(move || {
        let mut archive = open(source, &location)?;
        f(&mut archive, &location)
    })
    .await?
}

fn read_entry<T: DeserializeOwned>(
    archive: &mut Archive,
    name: &str,
    location: &str,
) -> LogResult<Option<T>> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_reader(entry)
        .map(Some)
        .map_err(|e| invalid(location, format!("{name}: {e}")))
}

fn read_header(archive: &mut Archive, location: &str) -> LogResult<EvalLog> {
    if let Some(header) = read_entry::<EvalLog>(archive, HEADER_ENTRY, location)? {
        return Ok(header);
    }
    match read_entry::<LogStart>(archive, START_ENTRY, location)? {
        Some(start) => Ok(started_log(start)),
        None => Err(invalid(location, "archive has neither header nor start journal")),
    }
}

fn read_samples(archive: &mut Archive, location: &str) -> LogResult<Vec<EvalSample>> {
    let names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(SAMPLES_DIR) && n.ends_with(".json"))
        .map(str::to_string)
        .collect();
    let mut samples = Vec::with_capacity(names.len());
    for name in names {
        if let Some(sample) = read_entry::<EvalSample>(archive, &name, location)? {
            samples.push(sample);
        }
    }
    samples.sort_by(|a, b| (a.epoch, &a.id).cmp(&(b.epoch, &b.id)));
    Ok(samples)
}

/// Entries for the body parts kept outside `header.json`.
fn finish_entries(log: &EvalLog) -> LogResult<Entries> {
    let mut entries = Vec::new();
    if let Some(reductions) = &log.reductions {
        entries.push(entry(REDUCTIONS_ENTRY, reductions)?);
    }
    if !log.logging.is_empty() {
        entries.push(entry(LOGGING_ENTRY, &log.logging)?);
    }
    Ok(entries)
}

fn entry<T: Serialize + ?Sized>(name: impl Into<String>, value: &T) -> LogResult<(String, Vec<u8>)> {
    Ok((name.into(), serde_json::to_vec(value)?))
}

fn write_entries<W: Write + Seek>(zip: &mut ZipWriter<W>, entries: Entries) -> LogResult<()> {
    for (name, data) in entries {
        zip.start_file(name, options())?;
        zip.write_all(&data)?;
    }
    Ok(())
}

fn sample_entries(samples: &[EvalSample]) -> LogResult<Entries> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(samples.len());
    for sample in samples {
        if seen.insert((sample.id.clone(), sample.epoch)) {
            entries.push(entry(sample_entry_name(&sample.id, sample.epoch), sample)?);
        }
    }
    Ok(entries)
}

/// Build a fresh archive holding `entries`.
async fn create(fs: &dyn LogFs, location: &str, entries: Entries) -> LogResult<()> {
    let bytes = tokio::task::spawn_blocking(move || -> LogResult<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        write_entries(&mut zip, entries)?;
        Ok(zip.finish()?.into_inner())
    })
    .await??;
    fs.write(location, &bytes).await
}

/// Add `entries` to an existing archive.
///
/// Local files are appended in place; remote objects are fetched, extended
/// and written back whole.
async fn append(fs: &dyn LogFs, location: &str, entries: Entries) -> LogResult<()> {
    let count = entries.len();
    match fs.local_path(location) {
        Some(path) => {
            let owned = location.to_string();
            tokio::task::spawn_blocking(move || -> LogResult<()> {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| io_not_found(&owned, e))?;
                let mut zip = ZipWriter::new_append(file)?;
                write_entries(&mut zip, entries)?;
                zip.finish()?;
                Ok(())
            })
            .await??;
        }
        None => {
            let bytes = fs.read(location).await?;
            let updated = tokio::task::spawn_blocking(move || -> LogResult<Vec<u8>> {
                let mut zip = ZipWriter::new_append(Cursor::new(bytes))?;
                write_entries(&mut zip, entries)?;
                Ok(zip.finish()?.into_inner())
            })
            .await??;
            fs.write(location, &updated).await?;
        }
    }
    debug!(location, entries = count, "appended archive entries");
    Ok(())
}

/// Codec for the native zip format.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalCodec;

#[async_trait]
impl LogCodec for EvalCodec {
    fn format(&self) -> LogFormat {
        LogFormat::Eval
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    async fn read_log(
        &self,
        fs: &dyn LogFs,
        location: &str,
        header_only: bool,
    ) -> LogResult<EvalLog> {
        with_archive(fs, location, move |archive, location| {
            let mut log = read_header(archive, location)?;
            if header_only {
                return Ok(log);
            }
            log.reductions = read_entry::<Vec<EvalSampleReductions>>(
                archive,
                REDUCTIONS_ENTRY,
                location,
            )?;
            log.logging = read_entry::<Vec<LoggingMessage>>(archive, LOGGING_ENTRY, location)?
                .unwrap_or_default();
            let samples = read_samples(archive, location)?;
            if !samples.is_empty() {
                log.samples = Some(samples);
            }
            Ok(log)
        })
        .await
    }

    async fn read_log_sample(
        &self,
        fs: &dyn LogFs,
        location: &str,
        id: &SampleId,
        epoch: u32,
    ) -> LogResult<EvalSample> {
        let id = id.clone();
        with_archive(fs, location, move |archive, location| {
            let name = sample_entry_name(&id, epoch);
            read_entry::<EvalSample>(archive, &name, location)?.ok_or_else(|| {
                LogError::SampleNotFound {
                    id,
                    epoch,
                    location: location.to_string(),
                }
            })
        })
        .await
    }

    async fn write_log(&self, fs: &dyn LogFs, location: &str, log: &EvalLog) -> LogResult<()> {
        let start = LogStart {
            version: log.version,
            eval: log.eval.clone(),
            plan: log.plan.clone(),
        };
        let samples = log.samples.as_deref().unwrap_or_default();
        let summaries: Vec<SampleSummary> = samples.iter().map(EvalSample::summary).collect();

        let mut entries = vec![entry(START_ENTRY, &start)?];
        entries.extend(sample_entries(samples)?);
        entries.push(entry(SUMMARIES_ENTRY, &summaries)?);
        entries.extend(finish_entries(log)?);
        entries.push(entry(HEADER_ENTRY, &log.header())?);
        create(fs, location, entries).await
    }

    async fn log_start(&self, fs: &dyn LogFs, location: &str, start: &LogStart) -> LogResult<()> {
        create(fs, location, vec![entry(START_ENTRY, start)?]).await
    }

    async fn log_samples(
        &self,
        fs: &dyn LogFs,
        location: &str,
        flush: u32,
        samples: &[EvalSample],
        summaries: &[SampleSummary],
    ) -> LogResult<()> {
        let mut entries = sample_entries(samples)?;
        entries.push(entry(format!("{SUMMARY_DIR}/{flush}.json"), summaries)?);
        append(fs, location, entries).await
    }

    async fn log_finish(
        &self,
        fs: &dyn LogFs,
        location: &str,
        finished: &EvalLog,
        summaries: &[SampleSummary],
    ) -> LogResult<()> {
        let mut entries = vec![entry(SUMMARIES_ENTRY, summaries)?];
        entries.extend(finish_entries(finished)?);
        entries.push(entry(HEADER_ENTRY, &finished.header())?);
        append(fs, location, entries).await
    }
}
