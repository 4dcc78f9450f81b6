//! End-to-end scheduler tests with a scripted model and in-process task registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use evalrun_core::{
    Dataset, DisplayMode, GenerateSolver, ModelApi, ModelRef, RunCoordinator, RunError, RunOptions,
    RunResult, RunScheduler, Sample, SandboxProvider, Scorer, SolverRegistry, SolverSpec,
    SystemMessage, Task, TaskRef, TaskRegistry, TaskState,
};
use evalrun_log::{
    read_eval_log, ChatMessage, EvalConfig, EvalStatus, FailOnError, GenerateConfig,
    MemoryObjectStore, ModelOutput, ModelUsage, ReadOptions, SampleId, SampleLimit,
    SampleSelection, SandboxSpec, Score, Storage,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Echoes the prompt back. Tracks in-flight calls per prompt prefix (the
/// text before the first `-`).
#[derive(Default)]
struct ScriptedModel {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    peak: Mutex<HashMap<String, usize>>,
    cancel_on_call: Option<CancellationToken>,
}

impl ScriptedModel {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn peak(&self, prefix: &str) -> usize {
        self.peak
            .lock()
            .unwrap()
            .get(prefix)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ModelApi for ScriptedModel {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _config: &GenerateConfig,
    ) -> RunResult<ModelOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages.last().map(|m| m.content.text()).unwrap_or_default();
        let prefix = prompt.split('-').next().unwrap_or_default().to_string();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let now = in_flight.entry(prefix.clone()).or_insert(0);
            *now += 1;
            let mut peak = self.peak.lock().unwrap();
            let max = peak.entry(prefix.clone()).or_insert(0);
            *max = (*max).max(*now);
        }
        if let Some(cancel) = &self.cancel_on_call {
            cancel.cancel();
        }
        tokio::time::sleep(self.delay).await;
        *self.in_flight.lock().unwrap().get_mut(&prefix).unwrap() -= 1;

        if prompt.contains("bad") {
            return Err(RunError::Model(format!("cannot answer {prompt}")));
        }
        Ok(ModelOutput {
            model: "mock/scripted".into(),
            completion: prompt,
            stop_reason: Some("stop".into()),
            usage: Some(ModelUsage::new(2, 2)),
        })
    }
}

struct Includes;

#[async_trait]
impl Scorer for Includes {
    fn name(&self) -> &str {
        "includes"
    }

    async fn score(&self, state: &TaskState, target: &Value) -> RunResult<Score> {
        let target = target.as_str().unwrap_or_default();
        Ok(Score::new(if state.completion().contains(target) {
            "C"
        } else {
            "I"
        }))
    }
}

fn dataset(prefix: &str, inputs: &[&str]) -> Dataset {
    let samples = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            Sample::new(i as i64 + 1, format!("{prefix}-{input}")).with_target(*input)
        })
        .collect();
    Dataset::new(prefix, samples)
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for (name, inputs) in [
        ("alpha", vec!["one", "two", "three"]),
        ("beta", vec!["four", "five", "six"]),
        ("mixed", vec!["good", "bad", "fine"]),
    ] {
        registry.register(name, move |_args| {
            Ok(Task::new(name, dataset(name, &inputs), Arc::new(GenerateSolver))
                .with_scorer(Arc::new(Includes)))
        });
    }
    registry
}

fn scheduler() -> RunScheduler {
    RunScheduler::new(Storage::local()).with_coordinator(Arc::new(RunCoordinator::new()))
}

fn options(dir: &tempfile::TempDir, config: EvalConfig) -> RunOptions {
    RunOptions {
        log_dir: Some(dir.path().to_string_lossy().to_string()),
        config,
        ..Default::default()
    }
}

fn tasks(names: &[&str]) -> Vec<TaskRef> {
    names.iter().map(|n| TaskRef::parse(n)).collect()
}

#[tokio::test]
async fn parallel_tasks_hold_one_sample_each() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedModel::with_delay(Duration::from_millis(20)));
    let model = ModelRef::new("mock/scripted", api.clone());
    let config = EvalConfig {
        max_tasks: Some(2),
        max_samples: Some(1),
        ..Default::default()
    };

    let logs = scheduler()
        .eval(&tasks(&["alpha", "beta"]), &[model], options(&dir, config), &registry())
        .await
        .unwrap();

    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].eval.task, "alpha");
    assert_eq!(logs[1].eval.task, "beta");
    assert!(logs.iter().all(|log| log.status == EvalStatus::Success));
    assert_eq!(logs[0].eval.run_id, logs[1].eval.run_id);
    assert_eq!(api.calls.load(Ordering::SeqCst), 6);
    assert_eq!(api.peak("alpha"), 1);
    assert_eq!(api.peak("beta"), 1);

    let results = logs[0].results.as_ref().unwrap();
    assert_eq!(results.completed_samples, 3);
    assert_eq!(results.scores[0].metrics["mean"], 1.0);
}

#[tokio::test]
async fn cancelled_sequence_stops_later_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler();
    let api = Arc::new(ScriptedModel {
        delay: Duration::from_millis(5),
        cancel_on_call: Some(scheduler.cancellation_token()),
        ..Default::default()
    });
    let model = ModelRef::new("mock/scripted", api.clone());

    let logs = scheduler
        .eval(
            &tasks(&["alpha", "beta"]),
            &[model],
            options(&dir, EvalConfig::default()),
            &registry(),
        )
        .await
        .unwrap();

    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].eval.task, "alpha");
    assert_eq!(logs[0].status, EvalStatus::Cancelled);
    assert_eq!(api.peak("beta"), 0);
}

#[tokio::test]
async fn one_sequence_runs_every_model() {
    let dir = tempfile::tempdir().unwrap();
    let a = ModelRef::new("mock/a", Arc::new(ScriptedModel::default()));
    let b = ModelRef::new("mock/b", Arc::new(ScriptedModel::default()));

    let logs = scheduler()
        .eval(&tasks(&["alpha"]), &[a, b], options(&dir, EvalConfig::default()), &registry())
        .await
        .unwrap();

    let models: Vec<&str> = logs.iter().map(|l| l.eval.model.as_str()).collect();
    assert_eq!(models, vec!["mock/a", "mock/b"]);
    assert_eq!(logs[0].stats.model_usage["mock/a"].total_tokens, 12);
}

#[tokio::test]
async fn second_concurrent_run_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(RunCoordinator::new());
    let scheduler = RunScheduler::new(Storage::local()).with_coordinator(coordinator.clone());
    let model = ModelRef::new("mock/scripted", Arc::new(ScriptedModel::default()));

    let held = coordinator.try_begin().unwrap();
    let err = scheduler
        .eval(&tasks(&["alpha"]), &[model.clone()], options(&dir, EvalConfig::default()), &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::RunAlreadyActive));
    assert!(err.is_precondition());

    drop(held);
    let logs = scheduler
        .eval(&tasks(&["alpha"]), &[model], options(&dir, EvalConfig::default()), &registry())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn dropping_a_run_stops_its_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(RunCoordinator::new());
    let scheduler = RunScheduler::new(Storage::local()).with_coordinator(coordinator.clone());
    let api = Arc::new(ScriptedModel::with_delay(Duration::from_millis(200)));
    let model = ModelRef::new("mock/scripted", api.clone());
    let config = EvalConfig {
        max_tasks: Some(2),
        max_samples: Some(1),
        ..Default::default()
    };

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        scheduler.eval(&tasks(&["alpha", "beta"]), &[model], options(&dir, config), &registry()),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(!coordinator.is_active());

    let calls = api.calls.load(Ordering::SeqCst);
    assert!(calls <= 2);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(api.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn unwriteable_log_dir_is_rejected_before_work() {
    let store = Arc::new(MemoryObjectStore::read_only("mem"));
    let api = Arc::new(ScriptedModel::default());
    let scheduler = RunScheduler::new(Storage::local().with_backend("mem", store))
        .with_coordinator(Arc::new(RunCoordinator::new()));
    let options = RunOptions {
        log_dir: Some("mem://bucket/logs".into()),
        ..Default::default()
    };

    let err = scheduler
        .eval(
            &tasks(&["alpha"]),
            &[ModelRef::new("mock/scripted", api.clone())],
            options,
            &registry(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::LogDirNotWriteable(_)));
    assert_eq!(api.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn usage_errors_abort_before_any_log_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let model = ModelRef::new("mock/scripted", Arc::new(ScriptedModel::default()));

    let conflict = EvalConfig {
        sample_id: Some(SampleSelection::One(SampleId::Int(1))),
        limit: Some(SampleLimit::Count(2)),
        ..Default::default()
    };
    let err = scheduler()
        .eval(&tasks(&["alpha"]), &[model.clone()], options(&dir, conflict), &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::SampleSelectionConflict));

    let zero_epochs = EvalConfig {
        epochs: Some(0),
        ..Default::default()
    };
    let err = scheduler()
        .eval(&tasks(&["alpha"]), &[model.clone()], options(&dir, zero_epochs), &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::InvalidEpochs(0)));

    let zero_tasks = EvalConfig {
        max_tasks: Some(0),
        ..Default::default()
    };
    let err = scheduler()
        .eval(&tasks(&["alpha"]), &[model], options(&dir, zero_tasks), &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::InvalidCapacity { .. }));

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn conversation_display_allows_one_model() {
    let dir = tempfile::tempdir().unwrap();
    let a = ModelRef::new("mock/a", Arc::new(ScriptedModel::default()));
    let b = ModelRef::new("mock/b", Arc::new(ScriptedModel::default()));
    let mut opts = options(&dir, EvalConfig::default());
    opts.display = DisplayMode::Conversation;

    let err = scheduler()
        .eval(&tasks(&["alpha"]), &[a.clone(), b], opts.clone(), &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::ConversationMultiModel { models: 2 }));

    let logs = scheduler()
        .eval(&tasks(&["alpha"]), &[a], opts, &registry())
        .await
        .unwrap();
    assert_eq!(logs[0].eval.config.max_samples, Some(1));
}

#[tokio::test]
async fn fail_on_error_threshold_decides_status() {
    let dir = tempfile::tempdir().unwrap();
    let model = ModelRef::new("mock/scripted", Arc::new(ScriptedModel::default()));

    // One of three fails: under an absolute threshold of two.
    let tolerant = EvalConfig {
        fail_on_error: Some(FailOnError::Threshold(2.0)),
        ..Default::default()
    };
    let logs = scheduler()
        .eval(&tasks(&["mixed"]), &[model.clone()], options(&dir, tolerant), &registry())
        .await
        .unwrap();
    assert_eq!(logs[0].status, EvalStatus::Success);
    assert_eq!(logs[0].results.as_ref().unwrap().completed_samples, 2);

    let full = read_eval_log(&Storage::local(), &logs[0].location, &ReadOptions::default())
        .await
        .unwrap();
    let failed = full.sample(&SampleId::Int(2), 1).unwrap();
    assert!(failed.error.as_ref().unwrap().message.contains("cannot answer"));

    // A proportion of 0.3 trips on one failure in three.
    let strict = EvalConfig {
        fail_on_error: Some(FailOnError::Threshold(0.3)),
        ..Default::default()
    };
    let logs = scheduler()
        .eval(&tasks(&["mixed"]), &[model], options(&dir, strict), &registry())
        .await
        .unwrap();
    assert_eq!(logs[0].status, EvalStatus::Error);
    assert!(logs[0].error.is_some());
}

#[tokio::test]
async fn debug_errors_surface_the_first_cause() {
    let dir = tempfile::tempdir().unwrap();
    let model = ModelRef::new("mock/scripted", Arc::new(ScriptedModel::default()));
    let mut opts = options(&dir, EvalConfig::default());
    opts.debug_errors = true;

    let err = scheduler()
        .eval(&tasks(&["mixed"]), &[model], opts, &registry())
        .await
        .unwrap_err();
    match err {
        RunError::SampleError { id, .. } => assert_eq!(id, SampleId::Int(2)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn solver_override_replaces_task_solver() {
    let dir = tempfile::tempdir().unwrap();
    let model = ModelRef::new("mock/scripted", Arc::new(ScriptedModel::default()));
    let mut solvers = SolverRegistry::new();
    solvers.register("terse", |_args| {
        Ok(Arc::new(evalrun_core::Chain::new(vec![
            Arc::new(SystemMessage::new("Answer tersely.")),
            Arc::new(GenerateSolver),
        ])) as Arc<dyn evalrun_core::Solver>)
    });
    let scheduler = scheduler().with_solvers(solvers);

    let mut opts = options(&dir, EvalConfig::default());
    opts.solver = Some(SolverSpec::new("terse"));
    let logs = scheduler
        .eval(&tasks(&["alpha"]), &[model.clone()], opts.clone(), &registry())
        .await
        .unwrap();
    assert_eq!(logs[0].eval.solver.as_deref(), Some("terse"));
    let steps: Vec<&str> = logs[0].plan.steps.iter().map(|s| s.solver.as_str()).collect();
    assert_eq!(steps, vec!["system_message", "generate"]);

    opts.solver = Some(SolverSpec::new("verbose"));
    let err = scheduler
        .eval(&tasks(&["alpha"]), &[model], opts, &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::SolverNotFound(_)));
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let model = ModelRef::new("mock/scripted", Arc::new(ScriptedModel::default()));
    let err = scheduler()
        .eval(&tasks(&["gamma"]), &[model], options(&dir, EvalConfig::default()), &registry())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::TaskNotFound(name) if name == "gamma"));
}

/// Tracks live sandboxes between init and cleanup.
#[derive(Default)]
struct CountingSandbox {
    live: AtomicUsize,
    peak: AtomicUsize,
    inits: AtomicUsize,
    cleanups: Mutex<Vec<bool>>,
}

#[async_trait]
impl SandboxProvider for CountingSandbox {
    fn provider(&self) -> &str {
        "counting"
    }

    fn default_concurrency(&self) -> usize {
        2
    }

    async fn sample_init(&self, spec: &SandboxSpec, _id: &SampleId, _epoch: u32) -> RunResult<()> {
        assert_eq!(spec.provider, "counting");
        self.inits.fetch_add(1, Ordering::SeqCst);
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn sample_cleanup(
        &self,
        _spec: &SandboxSpec,
        _id: &SampleId,
        _epoch: u32,
        cleanup: bool,
    ) -> RunResult<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.cleanups.lock().unwrap().push(cleanup);
        Ok(())
    }
}

fn sandboxed_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("boxed", |_args| {
        let inputs = ["a", "b", "c", "d", "e", "f"];
        Ok(Task::new("boxed", dataset("boxed", &inputs), Arc::new(GenerateSolver))
            .with_sandbox(SandboxSpec::new("counting")))
    });
    registry
}

async fn run_sandboxed(config: EvalConfig) -> Arc<CountingSandbox> {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(CountingSandbox::default());
    let scheduler = scheduler().with_sandbox_provider(provider.clone());
    let model = ModelRef::new(
        "mock/scripted",
        Arc::new(ScriptedModel::with_delay(Duration::from_millis(20))),
    );

    let logs = scheduler
        .eval(&tasks(&["boxed"]), &[model], options(&dir, config), &sandboxed_registry())
        .await
        .unwrap();
    assert_eq!(logs[0].status, EvalStatus::Success);
    assert_eq!(logs[0].eval.sandbox, Some(SandboxSpec::new("counting")));
    provider
}

#[tokio::test]
async fn sandbox_pool_uses_provider_capacity() {
    let provider = run_sandboxed(EvalConfig {
        max_samples: Some(6),
        ..Default::default()
    })
    .await;

    let peak = provider.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak {peak}");
    assert_eq!(provider.inits.load(Ordering::SeqCst), 6);
    assert_eq!(provider.live.load(Ordering::SeqCst), 0);
    let cleanups = provider.cleanups.lock().unwrap().clone();
    assert_eq!(cleanups, vec![true; 6]);
}

#[tokio::test]
async fn max_sandboxes_overrides_provider_and_cleanup_can_be_skipped() {
    let provider = run_sandboxed(EvalConfig {
        max_samples: Some(6),
        max_sandboxes: Some(1),
        sandbox_cleanup: Some(false),
        ..Default::default()
    })
    .await;

    assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
    assert_eq!(provider.inits.load(Ordering::SeqCst), 6);
    let cleanups = provider.cleanups.lock().unwrap().clone();
    assert_eq!(cleanups, vec![false; 6]);
}
