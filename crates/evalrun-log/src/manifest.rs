//! Directory manifest: relative log path -> log header.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::LogResult;
use crate::file::read_eval_log_headers;
use crate::fs::{join_location, Storage};
use crate::listing::{list_eval_logs, ListOptions};
use crate::model::EvalLog;

pub const DEFAULT_MANIFEST_NAME: &str = "logs.json";

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Manifest key for `location`: its path relative to `log_dir`, with
/// forward slashes.
pub fn manifest_eval_log_name(location: &str, log_dir: &str) -> String {
    let location = normalize(location);
    let dir = normalize(log_dir);
    let dir = dir.trim_end_matches('/');
    let relative = location
        .strip_prefix(dir)
        .filter(|rest| rest.starts_with('/'))
        .unwrap_or(location.as_str());
    relative.trim_start_matches('/').to_string()
}

/// Headers of every log under `log_dir`, keyed by relative path.
pub async fn build_log_dir_manifest(
    storage: &Storage,
    log_dir: &str,
) -> LogResult<BTreeMap<String, EvalLog>> {
    let infos = list_eval_logs(storage, log_dir, &ListOptions::default()).await?;
    let names: Vec<String> = infos.into_iter().map(|i| i.name).collect();
    let headers = read_eval_log_headers(storage, &names).await?;
    Ok(names
        .iter()
        .map(|name| manifest_eval_log_name(name, log_dir))
        .zip(headers)
        .collect())
}

/// Write the manifest for `log_dir` and return its location.
///
/// Defaults: file name `logs.json`, written into `log_dir` itself.
pub async fn write_log_dir_manifest(
    storage: &Storage,
    log_dir: &str,
    filename: Option<&str>,
    output_dir: Option<&str>,
) -> LogResult<String> {
    let manifest = build_log_dir_manifest(storage, log_dir).await?;
    let target = join_location(
        output_dir.unwrap_or(log_dir),
        filename.unwrap_or(DEFAULT_MANIFEST_NAME),
    );
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    storage.resolve(&target).write(&target, &bytes).await?;
    info!(location = %target, logs = manifest.len(), "wrote log manifest");
    Ok(target)
}
