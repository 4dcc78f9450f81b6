//! evalrun-log: Evaluation Log Storage
//!
//! This crate is the persistence layer for evalrun. It owns the `EvalLog`
//! data model and every byte that reaches a log location.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: incremental writes during long runs, header-only reads for listing,
//! and random access to individual samples.
//!
//! ## Key Components
//!
//! - `LogRecorder`: buffered incremental writer, one open log per task
//! - `LogCodec`: `eval` (zip, keyed sample index) and `json` (single document)
//! - `Storage` / `LogFs`: local filesystem and object-store backends
//! - `read_eval_log*` / `write_eval_log`: whole-log and per-sample access
//! - `list_eval_logs` / `write_log_dir_manifest`: directory indexing

pub mod attachments;
pub mod codec;
mod error;
pub mod file;
pub mod filename;
pub mod format;
pub mod fs;
pub mod listing;
pub mod manifest;
pub mod model;
pub mod recorder;

pub use attachments::{condense_sample, resolve_sample_attachments, AttachmentDigest};
pub use codec::{codec_for, LogCodec};
pub use error::{LogError, LogResult};
pub use file::{
    ensure_sample_ids, read_eval_log, read_eval_log_headers, read_eval_log_sample,
    read_eval_log_samples, write_eval_log, ReadOptions, SampleReader,
};
pub use filename::{is_log_file, log_file_name, LogFileName};
pub use format::{FormatChoice, LogFormat};
pub use fs::{FileInfo, FileKind, LocalFs, LogFs, MemoryObjectStore, Storage};
pub use listing::{default_log_dir, list_eval_logs, EvalLogInfo, ListOptions, LOG_DIR_ENV};
pub use manifest::{
    build_log_dir_manifest, manifest_eval_log_name, write_log_dir_manifest, DEFAULT_MANIFEST_NAME,
};
pub use model::*;
pub use recorder::{FinishLog, LogRecorder};
