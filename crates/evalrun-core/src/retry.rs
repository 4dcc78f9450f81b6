//! Rebuild and rerun a previously logged task.
//!
//! A retry reuses the prior task id and carries every error-free sample
//! forward, so only failed or missing samples run again.

use std::path::Path;

use evalrun_log::{EvalConfig, EvalLog, FailOnError, FormatChoice, LogFormat};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::{DisplayMode, RunOptions, SolverSpec};
use crate::error::{RunError, RunResult};
use crate::metrics::METRICS;
use crate::model::ModelResolver;
use crate::scheduler::RunScheduler;
use crate::task::{ResolvedTask, TaskRef, TaskResolver};

/// Caller overrides for a retry. `None` keeps the prior run's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOverrides {
    pub log_dir: Option<String>,
    pub log_format: Option<LogFormat>,
    pub max_samples: Option<usize>,
    pub max_tasks: Option<usize>,
    pub max_subprocesses: Option<usize>,
    pub max_sandboxes: Option<usize>,
    pub sandbox_cleanup: Option<bool>,
    pub fail_on_error: Option<FailOnError>,
    pub log_samples: Option<bool>,
    pub log_images: Option<bool>,
    pub log_buffer: Option<usize>,
    pub score: Option<bool>,
    pub score_display: Option<bool>,
    pub debug_errors: Option<bool>,
    pub display: Option<DisplayMode>,
    pub max_retries: Option<u32>,
    pub timeout: Option<u64>,
    pub max_connections: Option<usize>,
}

/// A run request rebuilt from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRequest {
    pub task: TaskRef,
    pub task_id: String,
    pub model: String,
    pub model_base_url: Option<String>,
    pub model_args: Map<String, Value>,
    pub options: RunOptions,
    pub previous: EvalLog,
}

/// Rebuild the run that produced `log`.
///
/// The task must still be resolvable: a recorded task file must exist on
/// disk, and a bare name must be known to `tasks`.
pub fn reconstruct(
    log: &EvalLog,
    overrides: &RetryOverrides,
    tasks: &dyn TaskResolver,
) -> RunResult<RetryRequest> {
    let eval = &log.eval;
    let task = match &eval.task_file {
        Some(file) => {
            if !Path::new(file).exists() {
                return Err(RunError::TaskFileNotFound(file.clone()));
            }
            TaskRef::File {
                file: file.clone(),
                name: eval.task.clone(),
            }
        }
        None => {
            if !tasks.has_task(&eval.task) {
                return Err(RunError::TaskNotFound(eval.task.clone()));
            }
            TaskRef::Name(eval.task.clone())
        }
    };

    let prior = &eval.config;
    let config = EvalConfig {
        max_samples: overrides.max_samples.or(prior.max_samples),
        max_tasks: overrides.max_tasks.or(prior.max_tasks),
        max_subprocesses: overrides.max_subprocesses.or(prior.max_subprocesses),
        max_sandboxes: overrides.max_sandboxes.or(prior.max_sandboxes),
        sandbox_cleanup: overrides.sandbox_cleanup.or(prior.sandbox_cleanup),
        fail_on_error: overrides.fail_on_error.or(prior.fail_on_error),
        log_samples: overrides.log_samples.or(prior.log_samples),
        log_images: overrides.log_images.or(prior.log_images),
        log_buffer: overrides.log_buffer.or(prior.log_buffer),
        score_display: overrides.score_display.or(prior.score_display),
        ..prior.clone()
    };

    let mut generate = log.plan.config.clone();
    generate.max_retries = overrides.max_retries.or(generate.max_retries);
    generate.timeout = overrides.timeout.or(generate.timeout);
    generate.max_connections = overrides.max_connections.or(generate.max_connections);

    let options = RunOptions {
        config,
        generate,
        log_dir: overrides.log_dir.clone(),
        log_format: overrides
            .log_format
            .map(FormatChoice::Fixed)
            .unwrap_or_default(),
        display: overrides.display.unwrap_or_default(),
        debug_errors: overrides.debug_errors.unwrap_or(false),
        score: overrides.score.unwrap_or(true),
        tags: eval.tags.clone(),
        solver: eval.solver.as_ref().map(|name| SolverSpec {
            name: name.clone(),
            args: eval.solver_args.clone().unwrap_or_default(),
        }),
        sandbox: eval.sandbox.clone(),
        task_args: eval.task_args.clone(),
    };

    Ok(RetryRequest {
        task,
        task_id: eval.task_id.clone(),
        model: eval.model.clone(),
        model_base_url: eval.model_base_url.clone(),
        model_args: eval.model_args.clone(),
        options,
        previous: log.clone(),
    })
}

/// Retry each log in turn and collect the new logs in input order.
///
/// Logs should be read with their samples; a header-only log reuses nothing.
pub async fn eval_retry(
    scheduler: &RunScheduler,
    logs: Vec<EvalLog>,
    overrides: &RetryOverrides,
    tasks: &dyn TaskResolver,
    models: &dyn ModelResolver,
) -> RunResult<Vec<EvalLog>> {
    let mut results = Vec::with_capacity(logs.len());
    for log in logs {
        let request = reconstruct(&log, overrides, tasks)?;
        METRICS.inc_retries();
        info!(task = %request.task, task_id = %request.task_id, "retrying task");

        let task = tasks.resolve(&request.task, &request.options.task_args)?;
        let model = models.resolve_model(
            &request.model,
            request.model_base_url.as_deref(),
            &request.model_args,
            &request.options.generate,
        )?;
        let resolved = ResolvedTask::new(task, model, 0)
            .with_args(request.options.task_args.clone())
            .with_id(request.task_id)
            .with_previous(request.previous);

        let run_id = Uuid::new_v4().simple().to_string();
        results.extend(scheduler.run(run_id, vec![resolved], request.options).await?);
    }
    Ok(results)
}
