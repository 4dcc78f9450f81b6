//! evalrun - evaluation log utilities
//!
//! ## Commands
//!
//! - `list`: List logs in a directory, newest first
//! - `manifest`: Write a header manifest for a log directory
//! - `show`: Print a log header, a full log, or one sample

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evalrun_log::{
    default_log_dir, list_eval_logs, read_eval_log, read_eval_log_sample, write_log_dir_manifest,
    EvalLogInfo, ListOptions, ReadOptions, SampleId, Storage, LOG_DIR_ENV,
};
use serde::Serialize;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "evalrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect evaluation log directories", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List logs, newest first
    List {
        /// Log directory
        #[arg(long, env = LOG_DIR_ENV)]
        log_dir: Option<String>,

        /// Only logs with this status (started, success, cancelled, error)
        #[arg(long)]
        status: Option<String>,

        /// Do not descend into subdirectories
        #[arg(long)]
        no_recursive: bool,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a manifest of every log header in a directory
    Manifest {
        /// Log directory
        #[arg(long, env = LOG_DIR_ENV)]
        log_dir: Option<String>,

        /// Manifest file name (default: logs.json)
        #[arg(long)]
        filename: Option<String>,

        /// Directory to write the manifest to (default: the log directory)
        #[arg(long)]
        output_dir: Option<String>,
    },

    /// Print a log as JSON
    Show {
        /// Log file location
        location: String,

        /// Skip the sample body
        #[arg(long)]
        header_only: bool,

        /// Print only this sample
        #[arg(long)]
        sample: Option<String>,

        /// Epoch of `--sample`
        #[arg(long, default_value = "1")]
        epoch: u32,

        /// Inline attachment content
        #[arg(long)]
        resolve_attachments: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    evalrun_core::init_tracing(cli.json_logs, level);

    let storage = Storage::local();
    match cli.command {
        Commands::List {
            log_dir,
            status,
            no_recursive,
            json,
        } => {
            let log_dir = log_dir.unwrap_or_else(default_log_dir);
            let logs = cmd_list(&storage, &log_dir, status, !no_recursive).await?;
            print_listing(&logs, json)
        }
        Commands::Manifest {
            log_dir,
            filename,
            output_dir,
        } => {
            let log_dir = log_dir.unwrap_or_else(default_log_dir);
            let written = cmd_manifest(
                &storage,
                &log_dir,
                filename.as_deref(),
                output_dir.as_deref(),
            )
            .await?;
            println!("Wrote {}", written);
            Ok(())
        }
        Commands::Show {
            location,
            header_only,
            sample,
            epoch,
            resolve_attachments,
        } => {
            let options = ReadOptions {
                header_only,
                resolve_attachments,
                ..Default::default()
            };
            let out = cmd_show(&storage, &location, sample.as_deref(), epoch, &options).await?;
            println!("{}", out);
            Ok(())
        }
    }
}

/// Sample ids that parse as integers are integer ids.
fn parse_sample_id(raw: &str) -> SampleId {
    raw.parse::<i64>()
        .map(SampleId::Int)
        .unwrap_or_else(|_| SampleId::Str(raw.to_string()))
}

async fn cmd_list(
    storage: &Storage,
    log_dir: &str,
    status: Option<String>,
    recursive: bool,
) -> Result<Vec<EvalLogInfo>> {
    let mut options = ListOptions {
        recursive,
        ..Default::default()
    };
    if let Some(status) = status {
        let status = status.to_ascii_lowercase();
        options = options.with_filter(move |log| log.status.to_string() == status);
    }
    debug!(log_dir, ?options, "listing logs");
    list_eval_logs(storage, log_dir, &options)
        .await
        .with_context(|| format!("Failed to list logs in '{}'", log_dir))
}

fn print_listing(logs: &[EvalLogInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(logs)?);
        return Ok(());
    }
    if logs.is_empty() {
        println!("No logs found");
        return Ok(());
    }
    for info in logs {
        let mtime = info
            .mtime
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:>10}  {:<20}  {}",
            mtime,
            info.size,
            info.task.as_deref().unwrap_or("-"),
            info.name
        );
    }
    Ok(())
}

async fn cmd_manifest(
    storage: &Storage,
    log_dir: &str,
    filename: Option<&str>,
    output_dir: Option<&str>,
) -> Result<String> {
    write_log_dir_manifest(storage, log_dir, filename, output_dir)
        .await
        .with_context(|| format!("Failed to write manifest for '{}'", log_dir))
}

async fn cmd_show(
    storage: &Storage,
    location: &str,
    sample: Option<&str>,
    epoch: u32,
    options: &ReadOptions,
) -> Result<String> {
    match sample {
        Some(raw) => {
            let id = parse_sample_id(raw);
            let sample = read_eval_log_sample(storage, location, &id, epoch, options)
                .await
                .with_context(|| format!("Sample {} (epoch {}) not found in '{}'", id, epoch, location))?;
            to_json(&sample)
        }
        None => {
            let log = read_eval_log(storage, location, options)
                .await
                .with_context(|| format!("Failed to read log '{}'", location))?;
            to_json(&log)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialise output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ids_prefer_integers() {
        assert_eq!(parse_sample_id("42"), SampleId::Int(42));
        assert_eq!(parse_sample_id("q-7"), SampleId::Str("q-7".into()));
    }

    #[test]
    fn show_arguments_parse() {
        let cli = Cli::try_parse_from([
            "evalrun", "show", "logs/a.eval", "--sample", "3", "--epoch", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Show {
                location,
                sample,
                epoch,
                header_only,
                ..
            } => {
                assert_eq!(location, "logs/a.eval");
                assert_eq!(sample.as_deref(), Some("3"));
                assert_eq!(epoch, 2);
                assert!(!header_only);
            }
            _ => panic!("expected show"),
        }
    }

    #[tokio::test]
    async fn empty_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let logs = cmd_list(
            &Storage::local(),
            &dir.path().to_string_lossy(),
            Some("success".into()),
            true,
        )
        .await
        .unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn manifest_of_empty_directory_is_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_string_lossy().to_string();
        let written = cmd_manifest(&Storage::local(), &log_dir, None, None)
            .await
            .unwrap();
        assert!(written.ends_with("logs.json"));
        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&written).unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({}));
    }

    #[tokio::test]
    async fn missing_log_reports_location() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("nope.eval").to_string_lossy().to_string();
        let err = cmd_show(&Storage::local(), &location, None, 1, &ReadOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("nope.eval"));
    }
}
