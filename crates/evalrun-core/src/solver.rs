//! Solvers and the per-sample state they transform.

use std::sync::Arc;

use async_trait::async_trait;
use evalrun_log::{
    ChatMessage, EvalPlanStep, GenerateConfig, ModelOutput, ModelUsage, SampleId,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::SampleContext;
use crate::error::RunResult;
use crate::model::ModelRef;

/// State threaded through a sample's solver steps.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub model: String,
    pub sample_id: SampleId,
    pub epoch: u32,
    pub input: Value,
    pub target: Value,
    pub messages: Vec<ChatMessage>,
    pub output: Option<ModelOutput>,
    pub metadata: Map<String, Value>,
    pub store: Map<String, Value>,
    /// Set by a solver to skip the remaining steps.
    pub completed: bool,
    pub usage: ModelUsage,
}

impl TaskState {
    /// Initial state for a sample. A string input becomes one user message;
    /// an array is read as a list of chat messages.
    pub fn new(
        model: impl Into<String>,
        sample_id: SampleId,
        epoch: u32,
        input: Value,
        target: Value,
    ) -> Self {
        let messages = match &input {
            Value::String(text) => vec![ChatMessage::user(text.clone())],
            Value::Array(_) => serde_json::from_value(input.clone())
                .unwrap_or_else(|_| vec![ChatMessage::user(input.to_string())]),
            Value::Null => Vec::new(),
            other => vec![ChatMessage::user(other.to_string())],
        };
        Self {
            model: model.into(),
            sample_id,
            epoch,
            input,
            target,
            messages,
            output: None,
            metadata: Map::new(),
            store: Map::new(),
            completed: false,
            usage: ModelUsage::default(),
        }
    }

    /// Text of the final output, if any.
    pub fn completion(&self) -> &str {
        self.output
            .as_ref()
            .map(|o| o.completion.as_str())
            .unwrap_or_default()
    }
}

/// Calls the task's model with the effective generation config.
#[derive(Debug, Clone)]
pub struct Generate {
    model: ModelRef,
    config: GenerateConfig,
}

impl Generate {
    pub fn new(model: ModelRef, config: GenerateConfig) -> Self {
        Self { model, config }
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    /// Append the model's reply to `state`.
    pub async fn generate(&self, mut state: TaskState, ctx: &SampleContext) -> RunResult<TaskState> {
        ctx.check_interrupt()?;
        ctx.check_generate_limits(&state)?;
        let output = self.model.generate(&state.messages, &self.config).await?;
        if let Some(usage) = &output.usage {
            state.usage.add(usage);
        }
        state
            .messages
            .push(ChatMessage::assistant(output.completion.clone()));
        state.output = Some(output);
        ctx.record_state(&state);
        ctx.check_limits(&state)?;
        Ok(state)
    }
}

/// One step of a solve plan.
#[async_trait]
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;

    /// Plan steps recorded in the log.
    fn steps(&self) -> Vec<EvalPlanStep> {
        vec![EvalPlanStep {
            solver: self.name().to_string(),
            params: Map::new(),
        }]
    }

    async fn solve(
        &self,
        state: TaskState,
        generate: &Generate,
        ctx: &SampleContext,
    ) -> RunResult<TaskState>;
}

/// Uniform adapter around every solver the scheduler runs.
///
/// After the inner solver returns it records the state on the context and
/// then checks the interrupt signal and the sample limits.
pub struct RegisteredSolver {
    name: String,
    params: Map<String, Value>,
    inner: Arc<dyn Solver>,
}

impl RegisteredSolver {
    pub fn new(name: impl Into<String>, params: Map<String, Value>, inner: Arc<dyn Solver>) -> Self {
        Self {
            name: name.into(),
            params,
            inner,
        }
    }

    /// Wrap `inner` under its own name.
    pub fn wrap(inner: Arc<dyn Solver>) -> Arc<dyn Solver> {
        let name = inner.name().to_string();
        Arc::new(Self::new(name, Map::new(), inner))
    }
}

#[async_trait]
impl Solver for RegisteredSolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn steps(&self) -> Vec<EvalPlanStep> {
        let mut steps = self.inner.steps();
        if let [only] = steps.as_mut_slice() {
            only.solver = self.name.clone();
            if only.params.is_empty() {
                only.params = self.params.clone();
            }
        }
        steps
    }

    async fn solve(
        &self,
        state: TaskState,
        generate: &Generate,
        ctx: &SampleContext,
    ) -> RunResult<TaskState> {
        let state = self.inner.solve(state, generate, ctx).await?;
        ctx.record_state(&state);
        ctx.check_interrupt()?;
        ctx.check_limits(&state)?;
        Ok(state)
    }
}

/// Runs solvers in order until one marks the state completed.
pub struct Chain {
    solvers: Vec<Arc<dyn Solver>>,
}

impl Chain {
    pub fn new(solvers: Vec<Arc<dyn Solver>>) -> Self {
        Self {
            solvers: solvers.into_iter().map(RegisteredSolver::wrap).collect(),
        }
    }
}

#[async_trait]
impl Solver for Chain {
    fn name(&self) -> &str {
        "chain"
    }

    fn steps(&self) -> Vec<EvalPlanStep> {
        self.solvers.iter().flat_map(|s| s.steps()).collect()
    }

    async fn solve(
        &self,
        mut state: TaskState,
        generate: &Generate,
        ctx: &SampleContext,
    ) -> RunResult<TaskState> {
        for solver in &self.solvers {
            if state.completed {
                debug!(solver = solver.name(), "state completed, skipping remaining steps");
                break;
            }
            state = solver.solve(state, generate, ctx).await?;
        }
        Ok(state)
    }
}

/// Single call to the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateSolver;

#[async_trait]
impl Solver for GenerateSolver {
    fn name(&self) -> &str {
        "generate"
    }

    async fn solve(
        &self,
        state: TaskState,
        generate: &Generate,
        ctx: &SampleContext,
    ) -> RunResult<TaskState> {
        generate.generate(state, ctx).await
    }
}

/// Prepends a system message.
#[derive(Debug, Clone)]
pub struct SystemMessage {
    text: String,
}

impl SystemMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl Solver for SystemMessage {
    fn name(&self) -> &str {
        "system_message"
    }

    fn steps(&self) -> Vec<EvalPlanStep> {
        let mut params = Map::new();
        params.insert("template".to_string(), Value::String(self.text.clone()));
        vec![EvalPlanStep {
            solver: self.name().to_string(),
            params,
        }]
    }

    async fn solve(
        &self,
        mut state: TaskState,
        _generate: &Generate,
        _ctx: &SampleContext,
    ) -> RunResult<TaskState> {
        state.messages.insert(0, ChatMessage::system(self.text.clone()));
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SampleLimits;
    use crate::error::RunError;
    use crate::governor::{ConcurrencyGovernor, GovernorLimits};
    use crate::model::ModelApi;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Fixed;

    #[async_trait]
    impl ModelApi for Fixed {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _config: &GenerateConfig,
        ) -> RunResult<ModelOutput> {
            Ok(ModelOutput {
                model: "mock/fixed".into(),
                completion: "42".into(),
                stop_reason: None,
                usage: Some(ModelUsage::new(5, 1)),
            })
        }
    }

    fn generate() -> Generate {
        Generate::new(
            ModelRef::new("mock/fixed", Arc::new(Fixed)),
            GenerateConfig::default(),
        )
    }

    fn context(cancel: CancellationToken, limits: SampleLimits) -> SampleContext {
        let governor = ConcurrencyGovernor::new(GovernorLimits::default()).unwrap();
        SampleContext::new(SampleId::Int(1), 1, cancel, limits, Arc::new(governor))
    }

    fn state() -> TaskState {
        TaskState::new("mock/fixed", SampleId::Int(1), 1, "q".into(), "42".into())
    }

    /// Counts calls and cancels the token it holds.
    struct Canceller {
        calls: Arc<AtomicUsize>,
        token: CancellationToken,
    }

    #[async_trait]
    impl Solver for Canceller {
        fn name(&self) -> &str {
            "canceller"
        }

        async fn solve(
            &self,
            mut state: TaskState,
            _generate: &Generate,
            _ctx: &SampleContext,
        ) -> RunResult<TaskState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            state.store.insert("seen".into(), Value::Bool(true));
            self.token.cancel();
            Ok(state)
        }
    }

    #[test]
    fn array_input_becomes_messages() {
        let input = serde_json::json!([
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]);
        let st = TaskState::new("m", SampleId::Int(1), 1, input, Value::Null);
        assert_eq!(st.messages.len(), 2);
    }

    #[tokio::test]
    async fn chain_generates_and_records_plan() {
        let chain = Chain::new(vec![
            Arc::new(SystemMessage::new("be brief")),
            Arc::new(GenerateSolver),
        ]);
        let steps = chain.steps();
        assert_eq!(
            steps.iter().map(|s| s.solver.as_str()).collect::<Vec<_>>(),
            vec!["system_message", "generate"]
        );

        let ctx = context(CancellationToken::new(), SampleLimits::default());
        let out = chain.solve(state(), &generate(), &ctx).await.unwrap();
        assert_eq!(out.completion(), "42");
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.usage.total_tokens, 6);
    }

    #[tokio::test]
    async fn adapter_records_state_before_reporting_interrupt() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Chain::new(vec![
            Arc::new(Canceller {
                calls: calls.clone(),
                token: token.clone(),
            }),
            Arc::new(Canceller {
                calls: calls.clone(),
                token: token.clone(),
            }),
        ]);
        let ctx = context(token, SampleLimits::default());
        let err = chain.solve(state(), &generate(), &ctx).await.unwrap_err();
        assert!(matches!(err, RunError::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let partial = ctx.latest_state().unwrap();
        assert_eq!(partial.store.get("seen"), Some(&Value::Bool(true)));
    }

    fn limited(limits: SampleLimits) -> SampleContext {
        context(CancellationToken::new(), limits)
    }

    #[tokio::test]
    async fn reaching_a_limit_exactly_is_not_exceeding_it() {
        // One generate yields 2 messages and 6 tokens.
        for limits in [
            SampleLimits {
                message: Some(2),
                ..Default::default()
            },
            SampleLimits {
                token: Some(6),
                ..Default::default()
            },
        ] {
            let ctx = limited(limits);
            let solved = RegisteredSolver::wrap(Arc::new(GenerateSolver))
                .solve(state(), &generate(), &ctx)
                .await
                .unwrap();
            assert_eq!(solved.messages.len(), 2);
            assert_eq!(solved.usage.total_tokens, 6);
        }
    }

    #[tokio::test]
    async fn generate_at_message_limit_is_refused() {
        let ctx = limited(SampleLimits {
            message: Some(2),
            ..Default::default()
        });
        let chain = Chain::new(vec![
            RegisteredSolver::wrap(Arc::new(GenerateSolver)),
            RegisteredSolver::wrap(Arc::new(GenerateSolver)),
        ]);
        let err = chain.solve(state(), &generate(), &ctx).await.unwrap_err();
        assert!(matches!(err, RunError::LimitExceeded(_)));
        assert_eq!(ctx.latest_state().map(|s| s.messages.len()), Some(2));
    }

    #[tokio::test]
    async fn generate_past_token_limit_is_exceeded() {
        let ctx = limited(SampleLimits {
            token: Some(5),
            ..Default::default()
        });
        let err = RegisteredSolver::wrap(Arc::new(GenerateSolver))
            .solve(state(), &generate(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::LimitExceeded(_)));
        assert_eq!(ctx.latest_state().map(|s| s.usage.total_tokens), Some(6));
    }
}
