//! Evaluation log data model.
//!
//! Canonical definitions for what gets persisted:
//! - `EvalLog`: header (spec, plan, status, results, stats) plus sample body
//! - `EvalSample`: outcome of one (sample id, epoch) execution
//! - `EvalConfig` / `GenerateConfig`: run-wide limits and model-call tuning

pub mod config;
pub mod log;
pub mod sample;

pub use config::{EvalConfig, FailOnError, GenerateConfig, SampleLimit, SampleSelection};
pub use log::{
    EvalDataset, EvalLog, EvalPlan, EvalPlanStep, EvalResults, EvalScore, EvalSampleReductions,
    EvalSampleScore, EvalSpec, EvalStats, EvalStatus, LogStart, LoggingMessage, SandboxSpec,
    LOG_SCHEMA_VERSION,
};
pub use sample::{
    ChatMessage, ContentPart, EvalError, EvalSample, LimitKind, MessageContent, ModelOutput,
    ModelUsage, Role, SampleId, SampleLimitExceeded, SampleSummary, Score,
};
