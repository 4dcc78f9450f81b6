//! evalrun-core: Run Scheduling
//!
//! Resolves tasks against models, governs how much runs at once and feeds
//! sample outcomes to the log recorder in `evalrun-log`.
//!
//! ## Layer 1 - Orchestration
//!
//! Focus: bounded concurrency, cooperative cancellation, partial-failure
//! policy and retry of failed runs.
//!
//! ## Key Components
//!
//! - `RunScheduler` / `RunCoordinator`: single active run, sequential or parallel task batches
//! - `ConcurrencyGovernor`: FIFO task, sample, subprocess and per-provider sandbox pools
//! - `SampleExecutor`: one (sample, epoch) through solver and scorers, under limits
//! - `SolverRegistry` / `TaskRegistry`: name to factory tables
//! - `eval_retry`: rebuild a run from its log and rerun what failed

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod governor;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod reducers;
pub mod registry;
pub mod retry;
pub mod sandbox;
pub mod scheduler;
pub mod solver;
pub mod task;
pub mod task_runner;
pub mod telemetry;

pub use config::{DisplayMode, Epochs, RunOptions, SolverSpec, DEFAULT_EPOCH_REDUCER};
pub use context::{SampleContext, SampleLimits};
pub use error::{AggregateError, RunError, RunResult};
pub use executor::{SampleExecutor, SampleOutcome, SampleSandbox};
pub use governor::{ConcurrencyGovernor, GovernorLimits, Lease, Pool, PoolKey};
pub use model::{ModelApi, ModelRef, ModelResolver, DEFAULT_MAX_CONNECTIONS};
pub use reducers::{reduce, reduce_scores, REDUCERS};
pub use registry::{SolverRegistry, TaskRegistry};
pub use retry::{eval_retry, reconstruct, RetryOverrides, RetryRequest};
pub use sandbox::{SandboxProvider, SandboxProviders};
pub use scheduler::{RunCoordinator, RunGuard, RunScheduler};
pub use solver::{Chain, Generate, GenerateSolver, RegisteredSolver, Solver, SystemMessage, TaskState};
pub use task::{Dataset, ResolvedTask, Sample, Scorer, Task, TaskRef, TaskResolver};
pub use task_runner::{run_task, TaskRunContext};
pub use telemetry::init_tracing;
