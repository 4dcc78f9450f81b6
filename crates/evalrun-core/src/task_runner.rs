//! Runs one resolved task to a finished log.
//!
//! Samples × epochs are spawned onto a `JoinSet` and admitted through the
//! task's sample pool. Outcomes are logged as they complete, in whatever
//! order they finish.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use evalrun_log::{
    EvalConfig, EvalDataset, EvalError, EvalLog, EvalPlan, EvalResults, EvalSample, EvalSpec,
    EvalStats, EvalStatus, FinishLog, LogRecorder, ModelUsage, SampleId, SampleSummary,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{Epochs, RunOptions, SolverSpec};
use crate::context::SampleLimits;
use crate::error::{AggregateError, RunError, RunResult};
use crate::executor::{SampleExecutor, SampleOutcome, SampleSandbox};
use crate::governor::{ConcurrencyGovernor, PoolKey};
use crate::metrics::METRICS;
use crate::obs;
use crate::reducers::{reduce_scores, REDUCERS};
use crate::sandbox::SandboxProviders;
use crate::solver::{Generate, Solver};
use crate::task::ResolvedTask;

/// Run-scoped state shared by every task of a run.
pub struct TaskRunContext {
    pub run_id: String,
    pub recorder: Arc<LogRecorder>,
    pub governor: Arc<ConcurrencyGovernor>,
    pub options: Arc<RunOptions>,
    /// Validated config persisted in every header.
    pub config: EvalConfig,
    /// Solver override applied to every task.
    pub solver: Option<(SolverSpec, Arc<dyn Solver>)>,
    pub sandboxes: Arc<SandboxProviders>,
    /// Run-wide interrupt signal.
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct Tally {
    summaries: Vec<SampleSummary>,
    usage: BTreeMap<String, ModelUsage>,
    errors: Vec<RunError>,
    cancelled: usize,
}

impl Tally {
    fn record(&mut self, sample: &EvalSample) {
        for (model, usage) in &sample.model_usage {
            self.usage.entry(model.clone()).or_default().add(usage);
        }
        match &sample.error {
            Some(err) => self.errors.push(RunError::SampleError {
                id: sample.id.clone(),
                epoch: sample.epoch,
                message: err.message.clone(),
            }),
            None => self.summaries.push(sample.summary()),
        }
    }
}

fn build_spec(
    resolved: &ResolvedTask,
    ctx: &TaskRunContext,
    task_id: &str,
    sample_ids: Vec<SampleId>,
) -> EvalSpec {
    let task = &resolved.task;
    let solver = ctx.solver.as_ref().map(|(spec, _)| spec);
    EvalSpec {
        run_id: ctx.run_id.clone(),
        created: Utc::now(),
        task: task.name.clone(),
        task_id: task_id.to_string(),
        task_version: task.version,
        task_file: task.file.clone(),
        task_args: resolved.task_args.clone(),
        solver: solver.map(|s| s.name.clone()),
        solver_args: solver.map(|s| s.args.clone()),
        tags: ctx.options.tags.clone(),
        dataset: EvalDataset {
            name: task.dataset.name.clone(),
            location: task.dataset.location.clone(),
            samples: Some(sample_ids.len()),
            sample_ids: Some(sample_ids),
            shuffled: Some(task.dataset.shuffled),
        },
        sandbox: effective_sandbox(resolved, ctx),
        model: resolved.model.name.clone(),
        model_base_url: resolved.model.base_url.clone(),
        model_args: resolved.model.args.clone(),
        config: ctx.config.clone(),
    }
}

fn effective_sandbox(
    resolved: &ResolvedTask,
    ctx: &TaskRunContext,
) -> Option<evalrun_log::SandboxSpec> {
    ctx.options
        .sandbox
        .clone()
        .or_else(|| resolved.sandbox.clone())
        .or_else(|| resolved.task.sandbox.clone())
}

/// Execute every selected sample of `resolved` for every epoch and finalize its log.
///
/// Sample failures are recorded on the log. They surface as an `Err` only
/// when the fail-on-error policy trips and `debug_errors` is set, in which
/// case the first failure is returned after the log is finalized.
#[instrument(skip_all, fields(task = %resolved.task.name, model = %resolved.model.name))]
pub async fn run_task(resolved: ResolvedTask, ctx: Arc<TaskRunContext>) -> RunResult<EvalLog> {
    let task = resolved.task.clone();
    let epochs = Epochs::new(
        ctx.config.epochs_or_default(),
        ctx.config.epochs_reducer.clone(),
    )?;
    let reducers = epochs.reducers();
    if let Some(unknown) = reducers.iter().find(|r| !REDUCERS.contains(&r.as_str())) {
        return Err(RunError::ReducerNotFound(unknown.clone()));
    }

    let task_id = resolved
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let samples = task.dataset.select(&ctx.config);
    let sample_ids: Vec<SampleId> = samples.iter().map(|s| s.id.clone()).collect();
    let total = samples.len() * epochs.count() as usize;

    let solver = match &ctx.solver {
        Some((_, solver)) => solver.clone(),
        None => task.solver.clone(),
    };
    let generate_config = resolved
        .model
        .config
        .merge(&task.config)
        .merge(&ctx.options.generate);
    let plan = EvalPlan {
        name: "plan".to_string(),
        steps: solver.steps(),
        config: generate_config.clone(),
    };

    let sandbox = effective_sandbox(&resolved, &ctx);
    let eval = build_spec(&resolved, &ctx, &task_id, sample_ids.clone());
    let location = ctx.recorder.log_init(eval, None)?;
    ctx.recorder.log_start(&location, plan).await?;
    obs::emit_task_started(&task.name, &task_id, &resolved.model.name, total);

    let mut stats = EvalStats {
        started_at: Some(Utc::now()),
        ..Default::default()
    };
    let mut tally = Tally::default();

    // Error-free samples from a prior attempt are carried over as-is.
    let mut reused: HashSet<(SampleId, u32)> = HashSet::new();
    if let Some(previous) = &resolved.previous {
        for sample in previous.samples.iter().flatten() {
            if sample.error.is_some()
                || sample.epoch > epochs.count()
                || !sample_ids.contains(&sample.id)
            {
                continue;
            }
            if reused.insert((sample.id.clone(), sample.epoch)) {
                tally.record(sample);
                if let Err(err) = ctx.recorder.log_sample(&location, sample.clone()).await {
                    return Err(abandon_log(&ctx, &location, stats, err.into()).await);
                }
            }
        }
        debug!(reused = reused.len(), "reused samples from previous log");
    }

    let slot = PoolKey::Samples(task_id.clone());
    let capacity = ctx
        .config
        .max_samples
        .unwrap_or_else(|| resolved.model.max_connections());
    ctx.governor.configure(slot.clone(), capacity)?;

    let executor = Arc::new(
        SampleExecutor::new(
            task_id.clone(),
            solver,
            Generate::new(resolved.model.clone(), generate_config),
            ctx.governor.clone(),
        )
        .with_scorers(task.scorers.clone(), ctx.options.score)
        .with_limits(SampleLimits::from_config(&ctx.config))
        .with_sandbox(sandbox.map(|spec| SampleSandbox {
            provider: ctx.sandboxes.get(&spec.provider),
            cleanup: ctx.config.sandbox_cleanup.unwrap_or(true),
            spec,
        })),
    );

    let cancel = ctx.cancel.child_token();
    let mut set = JoinSet::new();
    for epoch in 1..=epochs.count() {
        for sample in &samples {
            if reused.contains(&(sample.id.clone(), epoch)) {
                continue;
            }
            let executor = executor.clone();
            let sample = sample.clone();
            let cancel = cancel.clone();
            set.spawn(async move { executor.execute(sample, epoch, cancel).await });
        }
    }

    let policy = ctx.config.fail_on_error_or_default();
    let mut failed = false;
    let mut write_error: Option<RunError> = None;
    while let Some(joined) = set.join_next().await {
        let sample = match joined {
            Ok(SampleOutcome::Cancelled(sample)) => {
                tally.cancelled += 1;
                METRICS.inc_samples_cancelled();
                debug!(id = %sample.id, epoch = sample.epoch, "sample cancelled");
                continue;
            }
            Ok(SampleOutcome::Completed(sample)) => sample,
            Err(err) => {
                warn!(error = %err, "sample task did not complete");
                tally.errors.push(err.into());
                METRICS.inc_samples_failed();
                continue;
            }
        };
        if sample.error.is_some() {
            METRICS.inc_samples_failed();
        } else {
            METRICS.inc_samples_completed();
        }
        obs::emit_sample_completed(
            &task_id,
            &sample.id.to_string(),
            sample.epoch,
            sample.error.is_some(),
        );
        tally.record(&sample);
        if write_error.is_none() {
            if let Err(err) = ctx.recorder.log_sample(&location, sample).await {
                warn!(location = %location, error = %err, "sample write failed, stopping task");
                write_error = Some(err.into());
                cancel.cancel();
            }
        }

        if !failed && policy.should_fail(tally.errors.len(), total) {
            warn!(errors = tally.errors.len(), total, "fail-on-error threshold reached");
            failed = true;
            cancel.cancel();
        }
    }
    ctx.governor.release_pool(&slot);
    if let Some(err) = write_error {
        return Err(abandon_log(&ctx, &location, stats, err).await);
    }

    let status = if failed {
        EvalStatus::Error
    } else if ctx.cancel.is_cancelled() || tally.cancelled > 0 {
        EvalStatus::Cancelled
    } else {
        EvalStatus::Success
    };

    stats.completed_at = Some(Utc::now());
    stats.model_usage = std::mem::take(&mut tally.usage);
    let mut finish = FinishLog::new(status, stats);

    let mut results = EvalResults {
        total_samples: total,
        completed_samples: tally.summaries.len(),
        scores: Vec::new(),
    };
    if ctx.options.score && !tally.summaries.is_empty() {
        let (reductions, scores) = reduce_scores(&tally.summaries, &reducers)?;
        results.scores = scores;
        finish.reductions = Some(reductions);
    }
    finish.results = Some(results);

    let failures = AggregateError::new(std::mem::take(&mut tally.errors));
    if failed {
        finish.error = Some(EvalError::new(failures.to_string()));
    }

    let log = ctx.recorder.log_finish(&location, finish).await?;
    METRICS.inc_logs_finalized();
    obs::emit_log_finalized(&location, &log.status.to_string());
    obs::emit_task_finished(
        &task_id,
        &log.status.to_string(),
        tally.summaries.len(),
        total,
    );

    if failed && ctx.options.debug_errors {
        return Err(failures.into_first());
    }
    Ok(log)
}

/// Close `location` with status `error` after a failed write and hand the
/// failure back.
async fn abandon_log(
    ctx: &TaskRunContext,
    location: &str,
    mut stats: EvalStats,
    err: RunError,
) -> RunError {
    stats.completed_at = Some(Utc::now());
    let mut finish = FinishLog::new(EvalStatus::Error, stats);
    finish.error = Some(EvalError::new(err.to_string()));
    match ctx.recorder.log_finish(location, finish).await {
        Ok(_) => {
            METRICS.inc_logs_finalized();
            obs::emit_log_finalized(location, &EvalStatus::Error.to_string());
        }
        Err(finish_err) => warn!(location, error = %finish_err, "could not finalize log"),
    }
    err
}
