//! Runs one (sample, epoch) through the solver and scorers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use evalrun_log::{
    EvalError, EvalSample, LimitKind, SampleLimitExceeded, SandboxSpec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::context::{SampleContext, SampleLimits};
use crate::error::{RunError, RunResult};
use crate::governor::{ConcurrencyGovernor, Lease, PoolKey};
use crate::sandbox::SandboxProvider;
use crate::solver::{Generate, Solver, TaskState};
use crate::task::{Sample, Scorer};

/// What happened to one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Ran to an end: success, a sample error or a limit.
    Completed(EvalSample),
    /// Interrupted; carries whatever state was recorded before the signal.
    Cancelled(EvalSample),
}

impl SampleOutcome {
    pub fn sample(&self) -> &EvalSample {
        match self {
            SampleOutcome::Completed(s) | SampleOutcome::Cancelled(s) => s,
        }
    }

    pub fn into_sample(self) -> EvalSample {
        match self {
            SampleOutcome::Completed(s) | SampleOutcome::Cancelled(s) => s,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SampleOutcome::Cancelled(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SampleOutcome::Completed(s) if s.error.is_some())
    }
}

/// Sandbox a sample runs in, with its provider hooks if one is registered.
#[derive(Clone)]
pub struct SampleSandbox {
    pub spec: SandboxSpec,
    pub provider: Option<Arc<dyn SandboxProvider>>,
    pub cleanup: bool,
}

/// Everything needed to execute samples of one task.
pub struct SampleExecutor {
    task_id: String,
    solver: Arc<dyn Solver>,
    generate: Generate,
    scorers: Vec<Arc<dyn Scorer>>,
    score: bool,
    limits: SampleLimits,
    governor: Arc<ConcurrencyGovernor>,
    sandbox: Option<SampleSandbox>,
}

/// `None` if `cancel` fires first.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

impl SampleExecutor {
    pub fn new(
        task_id: impl Into<String>,
        solver: Arc<dyn Solver>,
        generate: Generate,
        governor: Arc<ConcurrencyGovernor>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            solver,
            generate,
            scorers: Vec::new(),
            score: true,
            limits: SampleLimits::default(),
            governor,
            sandbox: None,
        }
    }

    pub fn with_scorers(mut self, scorers: Vec<Arc<dyn Scorer>>, score: bool) -> Self {
        self.scorers = scorers;
        self.score = score;
        self
    }

    pub fn with_limits(mut self, limits: SampleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Option<SampleSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    fn initial_state(&self, sample: &Sample, epoch: u32) -> TaskState {
        let mut state = TaskState::new(
            self.generate.model().name.clone(),
            sample.id.clone(),
            epoch,
            sample.input.clone(),
            sample.target.clone(),
        );
        state.metadata = sample.metadata.clone();
        state
    }

    /// Execute `sample` for `epoch`. Never fails: errors land on the sample.
    #[instrument(skip(self, sample, cancel), fields(task_id = %self.task_id, sample_id = %sample.id))]
    pub async fn execute(
        &self,
        sample: Sample,
        epoch: u32,
        cancel: CancellationToken,
    ) -> SampleOutcome {
        let initial = self.initial_state(&sample, epoch);

        let slot = PoolKey::Samples(self.task_id.clone());
        let _slot = match until_cancelled(&cancel, self.governor.acquire(&slot)).await {
            None => return SampleOutcome::Cancelled(to_sample(&initial, None)),
            Some(Err(err)) => return SampleOutcome::Completed(failed(&initial, &err)),
            Some(Ok(lease)) => lease,
        };
        let _sandbox = match until_cancelled(&cancel, self.sandbox_lease()).await {
            None => return SampleOutcome::Cancelled(to_sample(&initial, None)),
            Some(Err(err)) => return SampleOutcome::Completed(failed(&initial, &err)),
            Some(Ok(lease)) => lease,
        };

        let ctx = SampleContext::new(
            sample.id.clone(),
            epoch,
            cancel,
            self.limits,
            self.governor.clone(),
        );
        let outcome = self.run(initial, &sample, &ctx).await;

        if let Some(sandbox) = &self.sandbox {
            if let Some(provider) = &sandbox.provider {
                if let Err(err) = provider
                    .sample_cleanup(&sandbox.spec, &sample.id, epoch, sandbox.cleanup)
                    .await
                {
                    warn!(error = %err, "sandbox cleanup failed");
                }
            }
        }
        outcome
    }

    async fn sandbox_lease(&self) -> RunResult<Option<Lease>> {
        match &self.sandbox {
            Some(sandbox) => {
                let key = PoolKey::Sandboxes(sandbox.spec.provider.clone());
                Ok(Some(self.governor.acquire(&key).await?))
            }
            None => Ok(None),
        }
    }

    async fn run(&self, initial: TaskState, sample: &Sample, ctx: &SampleContext) -> SampleOutcome {
        if let Some(sandbox) = &self.sandbox {
            if let Some(provider) = &sandbox.provider {
                if let Err(err) = provider
                    .sample_init(&sandbox.spec, &sample.id, ctx.epoch())
                    .await
                {
                    return SampleOutcome::Completed(finish(failed(&initial, &err), ctx));
                }
            }
        }

        match self.solve(initial.clone(), ctx).await {
            Ok(state) => {
                let sample = self.scored(state, None, ctx).await;
                SampleOutcome::Completed(finish(sample, ctx))
            }
            Err(RunError::LimitExceeded(limit)) => {
                debug!(kind = %limit.kind, "sample limit reached");
                let state = ctx.latest_state().unwrap_or(initial);
                let sample = self.scored(state, Some(limit), ctx).await;
                SampleOutcome::Completed(finish(sample, ctx))
            }
            Err(RunError::Interrupted) => {
                let state = ctx.latest_state().unwrap_or(initial);
                SampleOutcome::Cancelled(finish(to_sample(&state, None), ctx))
            }
            Err(err) => {
                let state = ctx.latest_state().unwrap_or(initial);
                SampleOutcome::Completed(finish(failed(&state, &err), ctx))
            }
        }
    }

    async fn solve(&self, state: TaskState, ctx: &SampleContext) -> RunResult<TaskState> {
        let solve = self.solver.solve(state, &self.generate, ctx);
        let bounded = async {
            match self.limits.time {
                Some(limit) => tokio::time::timeout(limit, solve).await.unwrap_or_else(|_| {
                    Err(RunError::LimitExceeded(SampleLimitExceeded {
                        kind: LimitKind::Time,
                        limit: limit.as_secs_f64(),
                    }))
                }),
                None => solve.await,
            }
        };
        until_cancelled(ctx.cancellation_token(), bounded)
            .await
            .unwrap_or(Err(RunError::Interrupted))
    }

    async fn scored(
        &self,
        state: TaskState,
        limit: Option<SampleLimitExceeded>,
        ctx: &SampleContext,
    ) -> EvalSample {
        let mut sample = to_sample(&state, limit);
        if !self.score {
            return sample;
        }
        let mut scores = BTreeMap::new();
        for scorer in &self.scorers {
            match scorer.score(&state, &state.target).await {
                Ok(score) => {
                    scores.insert(scorer.name().to_string(), score);
                }
                Err(err) => {
                    let err = RunError::Scorer {
                        scorer: scorer.name().to_string(),
                        message: err.to_string(),
                    };
                    warn!(sample_id = %ctx.sample_id(), error = %err, "scorer failed");
                    sample.error = Some(EvalError::new(err.to_string()));
                    return sample;
                }
            }
        }
        sample.scores = scores;
        sample
    }
}

fn to_sample(state: &TaskState, limit: Option<SampleLimitExceeded>) -> EvalSample {
    let mut sample = EvalSample::new(state.sample_id.clone(), state.epoch, state.input.clone());
    sample.target = state.target.clone();
    sample.messages = state.messages.clone();
    sample.output = state.output.clone();
    sample.metadata = state.metadata.clone();
    sample.store = state.store.clone();
    if state.usage.total_tokens > 0 {
        sample.model_usage.insert(state.model.clone(), state.usage);
    }
    sample.limit = limit;
    sample
}

fn failed(state: &TaskState, err: &RunError) -> EvalSample {
    let mut sample = to_sample(state, None);
    sample.error = Some(EvalError::new(err.to_string()));
    sample
}

fn finish(mut sample: EvalSample, ctx: &SampleContext) -> EvalSample {
    sample.total_time = Some(ctx.total_time().as_secs_f64());
    sample.working_time = Some(ctx.working_time().as_secs_f64());
    sample
}
