//! Top-level run control.
//!
//! A [`RunScheduler`] takes resolved tasks, checks run-wide preconditions
//! and drives them either as one governed batch or one sequence at a time.
//! Only one run may be active per [`RunCoordinator`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use evalrun_log::{EvalLog, EvalStatus, LogRecorder, Storage};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::RunOptions;
use crate::error::{AggregateError, RunError, RunResult};
use crate::governor::{ConcurrencyGovernor, GovernorLimits, PoolKey};
use crate::metrics::METRICS;
use crate::model::ModelRef;
use crate::obs::{self, RunSpan};
use crate::registry::SolverRegistry;
use crate::sandbox::{SandboxProvider, SandboxProviders};
use crate::task::{ResolvedTask, TaskRef, TaskResolver};
use crate::task_runner::{run_task, TaskRunContext};

/// Guards against overlapping top-level runs.
#[derive(Debug, Default)]
pub struct RunCoordinator {
    active: AtomicBool,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide coordinator.
    pub fn global() -> Arc<RunCoordinator> {
        static GLOBAL: OnceLock<Arc<RunCoordinator>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(RunCoordinator::new())).clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark a run active. Fails fast if one already is.
    pub fn try_begin(self: &Arc<Self>) -> RunResult<RunGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RunError::RunAlreadyActive)?;
        Ok(RunGuard {
            coordinator: self.clone(),
        })
    }
}

/// Held for the duration of a run; dropping it ends the run.
#[derive(Debug)]
pub struct RunGuard {
    coordinator: Arc<RunCoordinator>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.coordinator.active.store(false, Ordering::Release);
    }
}

/// Drives evaluation runs.
pub struct RunScheduler {
    coordinator: Arc<RunCoordinator>,
    storage: Storage,
    solvers: Arc<SolverRegistry>,
    sandboxes: Arc<SandboxProviders>,
    cancel: CancellationToken,
}

impl RunScheduler {
    /// Scheduler bound to the process-wide coordinator.
    pub fn new(storage: Storage) -> Self {
        Self {
            coordinator: RunCoordinator::global(),
            storage,
            solvers: Arc::new(SolverRegistry::new()),
            sandboxes: Arc::new(SandboxProviders::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<RunCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_solvers(mut self, solvers: SolverRegistry) -> Self {
        self.solvers = Arc::new(solvers);
        self
    }

    pub fn with_sandbox_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        Arc::make_mut(&mut self.sandboxes).register(provider);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Interrupt signal for every run on this scheduler. Once cancelled it
    /// stays cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run already-resolved tasks.
    pub async fn run(
        &self,
        run_id: impl Into<String>,
        tasks: Vec<ResolvedTask>,
        options: RunOptions,
    ) -> RunResult<Vec<EvalLog>> {
        let _guard = self.coordinator.try_begin()?;
        self.run_active(run_id.into(), tasks, options).await
    }

    /// Resolve `tasks` for every model and run them.
    ///
    /// Each task reference gets its own sequence number, shared by the
    /// models it is evaluated against.
    pub async fn eval(
        &self,
        tasks: &[TaskRef],
        models: &[ModelRef],
        options: RunOptions,
        resolver: &dyn TaskResolver,
    ) -> RunResult<Vec<EvalLog>> {
        let _guard = self.coordinator.try_begin()?;
        let mut resolved = Vec::with_capacity(tasks.len() * models.len());
        for (sequence, task_ref) in tasks.iter().enumerate() {
            let task = resolver.resolve(task_ref, &options.task_args)?;
            for model in models {
                resolved.push(
                    ResolvedTask::new(task.clone(), model.clone(), sequence)
                        .with_args(options.task_args.clone()),
                );
            }
        }
        let run_id = Uuid::new_v4().simple().to_string();
        self.run_active(run_id, resolved, options).await
    }

    async fn run_active(
        &self,
        run_id: String,
        tasks: Vec<ResolvedTask>,
        options: RunOptions,
    ) -> RunResult<Vec<EvalLog>> {
        let span = RunSpan::new(&run_id);
        span.in_span(self.run_inner(run_id.clone(), tasks, options))
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        tasks: Vec<ResolvedTask>,
        mut options: RunOptions,
    ) -> RunResult<Vec<EvalLog>> {
        if tasks.is_empty() {
            warn!("no tasks to run");
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let models: HashSet<&str> = tasks.iter().map(|t| t.model.name.as_str()).collect();
        let model_count = models.len().max(1);
        options.apply_display_constraints(model_count)?;
        let config = options.eval_config()?;
        if config.max_samples == Some(0) {
            return Err(RunError::InvalidCapacity {
                pool: "samples".to_string(),
            });
        }

        let log_dir = options.resolved_log_dir();
        let recorder = LogRecorder::new(self.storage.clone(), log_dir.clone(), options.log_format);
        if !recorder.is_writeable().await {
            return Err(RunError::LogDirNotWriteable(log_dir));
        }

        let solver = match &options.solver {
            Some(spec) => Some((spec.clone(), self.solvers.create(spec)?)),
            None => None,
        };

        let mut governor =
            ConcurrencyGovernor::new(GovernorLimits::from_config(&config, model_count))?;
        for (provider, capacity) in self.sandboxes.defaults() {
            governor = governor.with_sandbox_default(provider, capacity);
        }

        // Only an explicit cap lifts sequencing; the task pool default does not.
        let task_definitions = tasks.len() / model_count;
        let parallel = match config.max_tasks {
            Some(cap) if task_definitions > 1 && cap > 1 => Some(cap),
            _ => None,
        };

        obs::emit_run_started(&run_id, tasks.len(), model_count);
        let ctx = Arc::new(TaskRunContext {
            run_id: run_id.clone(),
            recorder: Arc::new(recorder),
            governor: Arc::new(governor),
            options: Arc::new(options),
            config,
            solver,
            sandboxes: self.sandboxes.clone(),
            cancel: self.cancel.child_token(),
        });
        // Abandoning the run future stops cooperative work in every task.
        let _abandon = ctx.cancel.clone().drop_guard();

        let logs = match parallel {
            Some(cap) => {
                info!(tasks = tasks.len(), max_tasks = cap, "running tasks in parallel");
                run_batch(tasks, ctx).await?
            }
            None => run_sequences(&run_id, tasks, ctx).await?,
        };

        METRICS.flush();
        obs::emit_run_finished(
            &run_id,
            started.elapsed().as_millis() as u64,
            logs.len(),
            logs.iter().all(|log| log.status == EvalStatus::Success),
        );
        Ok(logs)
    }
}

/// One batch per sequence, in ascending order. A cancelled log stops the
/// remaining sequences.
async fn run_sequences(
    run_id: &str,
    tasks: Vec<ResolvedTask>,
    ctx: Arc<TaskRunContext>,
) -> RunResult<Vec<EvalLog>> {
    let mut sequences: BTreeMap<usize, Vec<ResolvedTask>> = BTreeMap::new();
    for task in tasks {
        sequences.entry(task.sequence).or_default().push(task);
    }

    let mut logs = Vec::new();
    for (sequence, batch) in sequences {
        debug!(sequence, tasks = batch.len(), "running sequence");
        let results = run_batch(batch, ctx.clone()).await?;
        let cancelled = results
            .iter()
            .any(|log| log.status == EvalStatus::Cancelled);
        logs.extend(results);
        if cancelled {
            obs::emit_run_cancelled(run_id, sequence);
            break;
        }
    }
    Ok(logs)
}

/// Run `tasks` concurrently under the task pool. Logs come back in input
/// order; task failures are aggregated. Dropping the returned future aborts
/// every task still running.
#[instrument(skip_all, fields(tasks = tasks.len()))]
async fn run_batch(tasks: Vec<ResolvedTask>, ctx: Arc<TaskRunContext>) -> RunResult<Vec<EvalLog>> {
    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let ctx = ctx.clone();
        set.spawn(async move {
            let _slot = ctx.governor.acquire(&PoolKey::Tasks).await?;
            run_task(task, ctx).await.map(|log| (index, log))
        });
    }

    let mut logs = Vec::with_capacity(set.len());
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(indexed)) => logs.push(indexed),
            Ok(Err(err)) => errors.push(err),
            Err(err) => errors.push(err.into()),
        }
    }
    AggregateError::new(errors).into_result(ctx.options.debug_errors)?;
    logs.sort_by_key(|(index, _)| *index);
    Ok(logs.into_iter().map(|(_, log)| log).collect())
}
