//! Run request options.
//!
//! [`RunOptions`] is what a caller hands the scheduler. It carries the
//! persisted [`EvalConfig`] plus settings that only matter while the run is
//! in flight (display, log destination, error surfacing).

use std::fmt;
use std::str::FromStr;

use evalrun_log::{default_log_dir, EvalConfig, FormatChoice, GenerateConfig, SandboxSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RunError, RunResult};

/// Reducer applied across epochs when none is named.
pub const DEFAULT_EPOCH_REDUCER: &str = "mean";

/// Epoch count with its score reducers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epochs {
    count: u32,
    reducer: Option<Vec<String>>,
}

impl Epochs {
    pub fn new(count: u32, reducer: Option<Vec<String>>) -> RunResult<Self> {
        if count < 1 {
            return Err(RunError::InvalidEpochs(count));
        }
        Ok(Self { count, reducer })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Reducer names, `["mean"]` unless set.
    pub fn reducers(&self) -> Vec<String> {
        match &self.reducer {
            Some(names) if !names.is_empty() => names.clone(),
            _ => vec![DEFAULT_EPOCH_REDUCER.to_string()],
        }
    }
}

impl Default for Epochs {
    fn default() -> Self {
        Self {
            count: 1,
            reducer: None,
        }
    }
}

/// How run progress is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    Full,
    #[default]
    Plain,
    /// Streams one conversation at a time; forces serial execution.
    Conversation,
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayMode::Full => f.write_str("full"),
            DisplayMode::Plain => f.write_str("plain"),
            DisplayMode::Conversation => f.write_str("conversation"),
        }
    }
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(DisplayMode::Full),
            "plain" => Ok(DisplayMode::Plain),
            "conversation" => Ok(DisplayMode::Conversation),
            other => Err(format!("unknown display mode: {other}")),
        }
    }
}

/// Solver named in the registry plus its arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverSpec {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl SolverSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
        }
    }
}

/// Everything a caller can set on a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Limits and policies persisted in each log header.
    pub config: EvalConfig,
    /// Generation options layered over each task's and model's own.
    pub generate: GenerateConfig,
    /// Falls back to `EVALRUN_LOG_DIR`, then `./logs`.
    pub log_dir: Option<String>,
    pub log_format: FormatChoice,
    pub display: DisplayMode,
    /// Surface the first underlying failure instead of an aggregate.
    pub debug_errors: bool,
    /// Run scorers after solving.
    pub score: bool,
    pub tags: Vec<String>,
    /// Replaces every task's own solver.
    pub solver: Option<SolverSpec>,
    /// Replaces every task's own sandbox.
    pub sandbox: Option<SandboxSpec>,
    pub task_args: Map<String, Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config: EvalConfig::default(),
            generate: GenerateConfig::default(),
            log_dir: None,
            log_format: FormatChoice::Auto,
            display: DisplayMode::default(),
            debug_errors: false,
            score: true,
            tags: Vec::new(),
            solver: None,
            sandbox: None,
            task_args: Map::new(),
        }
    }
}

impl RunOptions {
    pub fn resolved_log_dir(&self) -> String {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }

    /// Validated epoch settings.
    pub fn epochs(&self) -> RunResult<Epochs> {
        match self.config.epochs {
            Some(count) => Epochs::new(count, self.config.epochs_reducer.clone()),
            None => Ok(Epochs {
                count: 1,
                reducer: self.config.epochs_reducer.clone(),
            }),
        }
    }

    /// Validate the selection and epoch settings and return the config to persist.
    pub fn eval_config(&self) -> RunResult<EvalConfig> {
        if self.config.sample_id.is_some() && self.config.limit.is_some() {
            return Err(RunError::SampleSelectionConflict);
        }
        self.epochs()?;
        Ok(self.config.clone())
    }

    /// Conversation display runs one task and one sample at a time, for a single model.
    pub fn apply_display_constraints(&mut self, model_count: usize) -> RunResult<()> {
        if self.display != DisplayMode::Conversation {
            return Ok(());
        }
        if model_count > 1 {
            return Err(RunError::ConversationMultiModel {
                models: model_count,
            });
        }
        if self.config.max_tasks.is_some() {
            self.config.max_tasks = Some(1);
        }
        self.config.max_samples = Some(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalrun_log::{SampleId, SampleLimit, SampleSelection};

    #[test]
    fn epochs_below_one_are_rejected() {
        assert!(matches!(Epochs::new(0, None), Err(RunError::InvalidEpochs(0))));
        for count in 1..5 {
            let epochs = Epochs::new(count, None).unwrap();
            assert_eq!(epochs.reducers(), vec!["mean".to_string()]);
        }
        let epochs = Epochs::new(3, Some(vec!["max".into()])).unwrap();
        assert_eq!(epochs.reducers(), vec!["max".to_string()]);
    }

    #[test]
    fn selection_conflict_is_a_usage_error() {
        let selections = [
            SampleSelection::One(SampleId::Int(1)),
            SampleSelection::Many(vec!["a".into(), "b".into()]),
        ];
        let limits = [SampleLimit::Count(3), SampleLimit::Range(2, 8)];
        for sample_id in &selections {
            for limit in limits {
                let mut options = RunOptions::default();
                options.config.sample_id = Some(sample_id.clone());
                options.config.limit = Some(limit);
                assert!(matches!(
                    options.eval_config(),
                    Err(RunError::SampleSelectionConflict)
                ));
            }
        }
    }

    #[test]
    fn zero_epochs_in_config_fails_validation() {
        let mut options = RunOptions::default();
        options.config.epochs = Some(0);
        assert!(options.eval_config().unwrap_err().is_precondition());
    }

    #[test]
    fn conversation_display_serialises_work() {
        let mut options = RunOptions {
            display: DisplayMode::Conversation,
            ..Default::default()
        };
        options.config.max_tasks = Some(4);
        options.config.max_samples = Some(8);
        options.apply_display_constraints(1).unwrap();
        assert_eq!(options.config.max_tasks, Some(1));
        assert_eq!(options.config.max_samples, Some(1));

        let mut options = RunOptions {
            display: DisplayMode::Conversation,
            ..Default::default()
        };
        assert!(matches!(
            options.apply_display_constraints(2),
            Err(RunError::ConversationMultiModel { models: 2 })
        ));
    }

    #[test]
    fn display_mode_parses() {
        assert_eq!("Conversation".parse::<DisplayMode>(), Ok(DisplayMode::Conversation));
        assert!("fancy".parse::<DisplayMode>().is_err());
    }
}
