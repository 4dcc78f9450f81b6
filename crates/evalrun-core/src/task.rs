//! Tasks, datasets and task resolution.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use evalrun_log::{EvalConfig, EvalLog, GenerateConfig, SandboxSpec, SampleId, Score};
use serde_json::{Map, Value};

use crate::error::RunResult;
use crate::model::ModelRef;
use crate::solver::{RegisteredSolver, Solver, TaskState};

/// How a task is named in a run request or a log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskRef {
    /// `<task-file>@<task-name>`
    File { file: String, name: String },
    /// A registered task name.
    Name(String),
}

impl TaskRef {
    pub fn parse(spec: &str) -> Self {
        match spec.rsplit_once('@') {
            Some((file, name)) if !file.is_empty() && !name.is_empty() => TaskRef::File {
                file: file.to_string(),
                name: name.to_string(),
            },
            _ => TaskRef::Name(spec.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TaskRef::File { name, .. } | TaskRef::Name(name) => name,
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRef::File { file, name } => write!(f, "{file}@{name}"),
            TaskRef::Name(name) => f.write_str(name),
        }
    }
}

/// One dataset item.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: SampleId,
    pub input: Value,
    pub target: Value,
    pub metadata: Map<String, Value>,
}

impl Sample {
    pub fn new(id: impl Into<SampleId>, input: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            target: Value::Null,
            metadata: Map::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<Value>) -> Self {
        self.target = target.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub name: Option<String>,
    pub location: Option<String>,
    pub samples: Vec<Sample>,
    pub shuffled: bool,
}

impl Dataset {
    pub fn new(name: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            name: Some(name.into()),
            location: None,
            samples,
            shuffled: false,
        }
    }

    /// Samples chosen by the `limit` or `sample_id` settings of `config`.
    pub fn select(&self, config: &EvalConfig) -> Vec<Sample> {
        if let Some(selection) = &config.sample_id {
            return self
                .samples
                .iter()
                .filter(|s| selection.contains(&s.id))
                .cloned()
                .collect();
        }
        match config.limit {
            Some(limit) => self.samples[limit.bounds(self.samples.len())].to_vec(),
            None => self.samples.clone(),
        }
    }
}

/// Scores a finished sample.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, state: &TaskState, target: &Value) -> RunResult<Score>;
}

/// A task definition: dataset, solver and scorers.
pub struct Task {
    pub name: String,
    pub version: u32,
    /// Source file the task was loaded from, if any.
    pub file: Option<String>,
    pub dataset: Dataset,
    pub solver: Arc<dyn Solver>,
    pub scorers: Vec<Arc<dyn Scorer>>,
    pub sandbox: Option<SandboxSpec>,
    pub config: GenerateConfig,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("file", &self.file)
            .field("samples", &self.dataset.samples.len())
            .field("solver", &self.solver.name())
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, dataset: Dataset, solver: Arc<dyn Solver>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            file: None,
            dataset,
            solver: RegisteredSolver::wrap(solver),
            scorers: Vec::new(),
            sandbox: None,
            config: GenerateConfig::default(),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.push(scorer);
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxSpec) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }
}

/// A task bound to one model and a sequence position.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub task: Arc<Task>,
    pub task_args: Map<String, Value>,
    pub model: ModelRef,
    pub sandbox: Option<SandboxSpec>,
    /// Index of the task definition among those sharing the run.
    pub sequence: usize,
    /// Task id to reuse instead of generating a fresh one.
    pub id: Option<String>,
    /// Prior log whose completed samples are carried over.
    pub previous: Option<EvalLog>,
}

impl ResolvedTask {
    pub fn new(task: Arc<Task>, model: ModelRef, sequence: usize) -> Self {
        Self {
            task,
            task_args: Map::new(),
            model,
            sandbox: None,
            sequence,
            id: None,
            previous: None,
        }
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.task_args = args;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_previous(mut self, log: EvalLog) -> Self {
        self.previous = Some(log);
        self
    }
}

/// Turns task references into task definitions.
pub trait TaskResolver: Send + Sync {
    fn resolve(&self, task: &TaskRef, args: &Map<String, Value>) -> RunResult<Arc<Task>>;

    /// Whether a bare task name is resolvable.
    fn has_task(&self, name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalrun_log::{SampleLimit, SampleSelection};

    fn dataset() -> Dataset {
        Dataset::new(
            "d",
            (1i64..=5).map(|i| Sample::new(i, format!("q{i}"))).collect(),
        )
    }

    #[test]
    fn parse_task_refs() {
        assert_eq!(
            TaskRef::parse("tasks/math.py@addition"),
            TaskRef::File {
                file: "tasks/math.py".into(),
                name: "addition".into()
            }
        );
        assert_eq!(TaskRef::parse("addition"), TaskRef::Name("addition".into()));
        assert_eq!(TaskRef::parse("@x"), TaskRef::Name("@x".into()));
        assert_eq!(TaskRef::parse("a.py@t").to_string(), "a.py@t");
    }

    #[test]
    fn select_by_limit_and_id() {
        let ds = dataset();
        let mut config = EvalConfig::default();
        assert_eq!(ds.select(&config).len(), 5);

        config.limit = Some(SampleLimit::Count(2));
        let ids: Vec<SampleId> = ds.select(&config).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![SampleId::Int(1), SampleId::Int(2)]);

        config.limit = Some(SampleLimit::Range(3, 10));
        assert_eq!(ds.select(&config).len(), 2);

        config.limit = None;
        config.sample_id = Some(SampleSelection::Many(vec![SampleId::Int(4), SampleId::Int(9)]));
        let ids: Vec<SampleId> = ds.select(&config).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![SampleId::Int(4)]);
    }
}
