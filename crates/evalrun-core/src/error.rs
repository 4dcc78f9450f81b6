//! Error taxonomy for run scheduling.

use std::fmt;

use evalrun_log::{LogError, SampleId, SampleLimitExceeded};

/// Errors produced while scheduling and executing a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    // Preconditions: raised before any sample work starts.
    #[error("an evaluation run is already active in this process")]
    RunAlreadyActive,

    #[error("log directory is not writeable: {0}")]
    LogDirNotWriteable(String),

    #[error("conversation display cannot be used when evaluating more than one model ({models} requested)")]
    ConversationMultiModel { models: usize },

    #[error("sample_id and limit cannot both be specified")]
    SampleSelectionConflict,

    #[error("epochs must be at least 1 (got {0})")]
    InvalidEpochs(u32),

    #[error("capacity for {pool} pool must be at least 1")]
    InvalidCapacity { pool: String },

    #[error("concurrency pool closed: {0}")]
    PoolClosed(String),

    // Resolution
    #[error("task file not found: {0}")]
    TaskFileNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("solver not found: {0}")]
    SolverNotFound(String),

    #[error("unknown epoch reducer: {0}")]
    ReducerNotFound(String),

    // Sample scoped
    #[error("sample {id} (epoch {epoch}) failed: {message}")]
    SampleError {
        id: SampleId,
        epoch: u32,
        message: String,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("scorer {scorer} failed: {message}")]
    Scorer { scorer: String, message: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// A per-sample limit was reached. Terminates the sample, not the run.
    #[error("{} limit of {} exceeded", .0.kind, .0.limit)]
    LimitExceeded(SampleLimitExceeded),

    /// Interrupt signal observed between solver steps.
    #[error("sample interrupted")]
    Interrupted,

    #[error(transparent)]
    SampleFailures(#[from] AggregateError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("task join failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for RunError {
    fn from(err: tokio::task::JoinError) -> Self {
        RunError::Join(err.to_string())
    }
}

impl RunError {
    /// Fatal errors raised before scheduling starts.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RunError::RunAlreadyActive
                | RunError::LogDirNotWriteable(_)
                | RunError::ConversationMultiModel { .. }
                | RunError::SampleSelectionConflict
                | RunError::InvalidEpochs(_)
                | RunError::InvalidCapacity { .. }
        )
    }

    /// Errors that end a sample early without counting as a failure.
    pub fn is_sample_control(&self) -> bool {
        matches!(self, RunError::LimitExceeded(_) | RunError::Interrupted)
    }
}

/// Result type for run operations.
pub type RunResult<T> = std::result::Result<T, RunError>;

/// Ordered collection of failures raised concurrently.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<RunError>,
}

impl AggregateError {
    pub fn new(errors: Vec<RunError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[RunError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first underlying cause. Only used when debugging errors.
    pub fn into_first(self) -> RunError {
        match self.errors.into_iter().next() {
            Some(first) => first,
            None => RunError::SampleFailures(AggregateError::new(Vec::new())),
        }
    }

    /// `Ok` when empty; a single cause is returned unwrapped when `debug`.
    pub fn into_result(self, debug: bool) -> RunResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else if debug {
            Err(self.into_first())
        } else {
            Err(RunError::SampleFailures(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no failures"),
            [only] => write!(f, "1 failure: {only}"),
            [first, rest @ ..] => {
                write!(f, "{} failures: {first}", rest.len() + 1)?;
                for err in rest {
                    write!(f, "; {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_classification() {
        assert!(RunError::RunAlreadyActive.is_precondition());
        assert!(RunError::InvalidEpochs(0).is_precondition());
        assert!(RunError::SampleSelectionConflict.is_precondition());
        assert!(!RunError::TaskNotFound("x".into()).is_precondition());
        assert!(!RunError::Interrupted.is_precondition());
    }

    #[test]
    fn aggregate_keeps_every_cause() {
        let agg = AggregateError::new(vec![
            RunError::Model("timeout".into()),
            RunError::Sandbox("exited".into()),
        ]);
        let text = agg.to_string();
        assert!(text.starts_with("2 failures"));
        assert!(text.contains("timeout") && text.contains("exited"));

        match agg.into_result(false) {
            Err(RunError::SampleFailures(inner)) => assert_eq!(inner.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn debug_mode_surfaces_first_cause() {
        let agg = AggregateError::new(vec![
            RunError::Model("first".into()),
            RunError::Model("second".into()),
        ]);
        match agg.into_result(true) {
            Err(RunError::Model(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(AggregateError::new(Vec::new()).into_result(true).is_ok());
    }
}
