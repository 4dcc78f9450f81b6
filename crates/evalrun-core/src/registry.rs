//! Name to factory tables for solvers and tasks.
//!
//! Populated at startup; lookups return a not-found error instead of
//! guessing.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::SolverSpec;
use crate::error::{RunError, RunResult};
use crate::solver::{RegisteredSolver, Solver};
use crate::task::{Task, TaskRef, TaskResolver};

pub type SolverFactory =
    Arc<dyn Fn(&Map<String, Value>) -> RunResult<Arc<dyn Solver>> + Send + Sync>;
pub type TaskFactory = Arc<dyn Fn(&Map<String, Value>) -> RunResult<Task> + Send + Sync>;

#[derive(Clone, Default)]
pub struct SolverRegistry {
    factories: BTreeMap<String, SolverFactory>,
}

impl fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> RunResult<Arc<dyn Solver>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(solver = %name, "solver registered");
        self.factories.insert(name, Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the solver named by `spec`, wrapped in [`RegisteredSolver`].
    pub fn create(&self, spec: &SolverSpec) -> RunResult<Arc<dyn Solver>> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| RunError::SolverNotFound(spec.name.clone()))?;
        let inner = factory(&spec.args)?;
        Ok(Arc::new(RegisteredSolver::new(
            spec.name.clone(),
            spec.args.clone(),
            inner,
        )))
    }
}

#[derive(Clone)]
struct TaskEntry {
    file: Option<String>,
    factory: TaskFactory,
}

/// Registered tasks, optionally tied to the file that defines them.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskEntry>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("names", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> RunResult<Task> + Send + Sync + 'static,
    {
        self.insert(name.into(), None, Arc::new(factory));
        self
    }

    /// Register a task defined in `file`; it resolves as `<file>@<name>`.
    pub fn register_file<F>(
        &mut self,
        file: impl Into<String>,
        name: impl Into<String>,
        factory: F,
    ) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> RunResult<Task> + Send + Sync + 'static,
    {
        self.insert(name.into(), Some(file.into()), Arc::new(factory));
        self
    }

    fn insert(&mut self, name: String, file: Option<String>, factory: TaskFactory) {
        debug!(task = %name, file = ?file, "task registered");
        self.tasks.insert(name, TaskEntry { file, factory });
    }
}

impl TaskResolver for TaskRegistry {
    fn resolve(&self, task: &TaskRef, args: &Map<String, Value>) -> RunResult<Arc<Task>> {
        let (entry, file) = match task {
            TaskRef::File { file, name } => {
                if !Path::new(file).exists() {
                    return Err(RunError::TaskFileNotFound(file.clone()));
                }
                let entry = self
                    .tasks
                    .get(name)
                    .filter(|e| e.file.as_deref().map_or(true, |f| f == file))
                    .ok_or_else(|| RunError::TaskNotFound(task.to_string()))?;
                (entry, Some(file.clone()))
            }
            TaskRef::Name(name) => {
                let entry = self
                    .tasks
                    .get(name)
                    .ok_or_else(|| RunError::TaskNotFound(name.clone()))?;
                (entry, entry.file.clone())
            }
        };
        let mut built = (entry.factory)(args)?;
        if built.file.is_none() {
            built.file = file;
        }
        Ok(Arc::new(built))
    }

    fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}
