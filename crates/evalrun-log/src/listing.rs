//! Directory listing of logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::LogResult;
use crate::file::read_eval_log_headers;
use crate::filename::{is_log_file, LogFileName};
use crate::format::LogFormat;
use crate::fs::Storage;
use crate::model::EvalLog;

/// Environment variable overriding the default log directory.
pub const LOG_DIR_ENV: &str = "EVALRUN_LOG_DIR";

pub const DEFAULT_LOG_DIR: &str = "./logs";

/// Log directory from the environment, else `./logs`.
pub fn default_log_dir() -> String {
    std::env::var(LOG_DIR_ENV)
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

/// Listing entry. Built from file metadata and the file name only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalLogInfo {
    pub name: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub task: Option<String>,
    pub task_id: Option<String>,
    pub suffix: Option<String>,
}

/// Predicate over log headers.
pub type HeaderFilter = Arc<dyn Fn(&EvalLog) -> bool + Send + Sync>;

/// Options for [`list_eval_logs`].
#[derive(Clone)]
pub struct ListOptions {
    /// Formats to include; empty means all.
    pub formats: Vec<LogFormat>,
    pub recursive: bool,
    /// Newest first when true.
    pub descending: bool,
    /// Keep only logs whose header matches.
    pub filter: Option<HeaderFilter>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            formats: Vec::new(),
            recursive: true,
            descending: true,
            filter: None,
        }
    }
}

impl std::fmt::Debug for ListOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListOptions")
            .field("formats", &self.formats)
            .field("recursive", &self.recursive)
            .field("descending", &self.descending)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl ListOptions {
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EvalLog) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

/// List logs in `log_dir` sorted by modification time.
///
/// A missing directory yields an empty list.
pub async fn list_eval_logs(
    storage: &Storage,
    log_dir: &str,
    options: &ListOptions,
) -> LogResult<Vec<EvalLogInfo>> {
    let formats: Vec<LogFormat> = if options.formats.is_empty() {
        LogFormat::ALL.to_vec()
    } else {
        options.formats.clone()
    };

    let fs = storage.resolve(log_dir);
    let files = match fs.ls(log_dir, options.recursive).await {
        Ok(files) => files,
        Err(err) if err.is_not_found() => {
            debug!(log_dir, "log directory does not exist");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    let mut infos: Vec<EvalLogInfo> = files
        .into_iter()
        .filter(|f| is_log_file(&f.name, &formats))
        .map(|f| {
            let parsed = LogFileName::parse(&f.name);
            EvalLogInfo {
                name: f.name,
                size: f.size,
                mtime: f.mtime,
                task: parsed.task,
                task_id: parsed.task_id,
                suffix: parsed.suffix,
            }
        })
        .collect();

    infos.sort_by(|a, b| {
        let ord = a.mtime.cmp(&b.mtime).then_with(|| a.name.cmp(&b.name));
        if options.descending {
            ord.reverse()
        } else {
            ord
        }
    });

    if let Some(filter) = &options.filter {
        let names: Vec<String> = infos.iter().map(|i| i.name.clone()).collect();
        let headers = read_eval_log_headers(storage, &names).await?;
        infos = infos
            .into_iter()
            .zip(headers)
            .filter(|(_, header)| filter(header))
            .map(|(info, _)| info)
            .collect();
    }

    debug!(log_dir, count = infos.len(), "listed logs");
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_list_everything_newest_first() {
        let options = ListOptions::default();
        assert!(options.formats.is_empty());
        assert!(options.recursive);
        assert!(options.descending);
        assert!(options.filter.is_none());
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent").to_string_lossy().into_owned();
        let infos = list_eval_logs(&Storage::local(), &missing, &ListOptions::default())
            .await
            .unwrap();
        assert!(infos.is_empty());
    }
}
