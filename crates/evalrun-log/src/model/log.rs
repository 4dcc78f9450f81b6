//! EvalLog header and body.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::config::{EvalConfig, GenerateConfig};
use super::sample::{EvalError, EvalSample, ModelUsage, SampleId};

/// Schema version written into every log.
pub const LOG_SCHEMA_VERSION: u32 = 2;

fn default_version() -> u32 {
    LOG_SCHEMA_VERSION
}

/// Lifecycle status of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Started,
    Success,
    Cancelled,
    Error,
}

impl EvalStatus {
    /// Partial bodies are only legal in these statuses.
    pub fn allows_partial_body(&self) -> bool {
        matches!(
            self,
            EvalStatus::Started | EvalStatus::Cancelled | EvalStatus::Error
        )
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvalStatus::Started => "started",
            EvalStatus::Success => "success",
            EvalStatus::Cancelled => "cancelled",
            EvalStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Sandbox declared by a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Provider identity (e.g. `docker`, `local`).
    #[serde(rename = "type")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl SandboxSpec {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            config: None,
        }
    }
}

/// Dataset description, including the sample-id index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalDataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<usize>,
    /// Ordered unique ids of the samples this log should contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_ids: Option<Vec<SampleId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffled: Option<bool>,
}

/// Identity and configuration of the evaluated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSpec {
    pub run_id: String,
    pub created: DateTime<Utc>,
    pub task: String,
    pub task_id: String,
    #[serde(default)]
    pub task_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_file: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub task_args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver_args: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dataset: EvalDataset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSpec>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub model_args: Map<String, Value>,
    #[serde(default)]
    pub config: EvalConfig,
}

/// One solver step of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPlanStep {
    pub solver: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

/// Solver plan and the generation config it ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPlan {
    #[serde(default = "default_plan_name")]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<EvalPlanStep>,
    #[serde(default)]
    pub config: GenerateConfig,
}

fn default_plan_name() -> String {
    "plan".to_string()
}

impl Default for EvalPlan {
    fn default() -> Self {
        Self {
            name: default_plan_name(),
            steps: Vec::new(),
            config: GenerateConfig::default(),
        }
    }
}

/// Aggregate metrics for one scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalScore {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

/// Task-level results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    pub total_samples: usize,
    pub completed_samples: usize,
    #[serde(default)]
    pub scores: Vec<EvalScore>,
}

/// Timing and usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_usage: BTreeMap<String, ModelUsage>,
}

/// Epoch-reduced score of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSampleScore {
    pub sample_id: SampleId,
    pub value: f64,
}

/// Per-scorer epoch reductions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSampleReductions {
    pub scorer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
    pub samples: Vec<EvalSampleScore>,
}

/// Free-form logging output captured during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingMessage {
    pub level: String,
    pub message: String,
    pub created: DateTime<Utc>,
}

/// Journal record written when a log is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStart {
    pub version: u32,
    pub eval: EvalSpec,
    pub plan: EvalPlan,
}

/// The persisted unit of record.
///
/// `samples`, `reductions` and `logging` form the body; everything else is
/// the header and must be readable without touching the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalLog {
    #[serde(default = "default_version")]
    pub version: u32,
    pub status: EvalStatus,
    pub eval: EvalSpec,
    #[serde(default)]
    pub plan: EvalPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<EvalResults>,
    #[serde(default)]
    pub stats: EvalStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EvalError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<EvalSample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reductions: Option<Vec<EvalSampleReductions>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logging: Vec<LoggingMessage>,
    /// Where this log was read from or written to.
    #[serde(skip)]
    pub location: String,
}

impl EvalLog {
    /// New log in `started` status.
    pub fn started(eval: EvalSpec, plan: EvalPlan) -> Self {
        Self {
            version: LOG_SCHEMA_VERSION,
            status: EvalStatus::Started,
            eval,
            plan,
            results: None,
            stats: EvalStats {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            error: None,
            samples: None,
            reductions: None,
            logging: Vec::new(),
            location: String::new(),
        }
    }

    /// Copy of this log with the body stripped.
    pub fn header(&self) -> EvalLog {
        EvalLog {
            samples: None,
            reductions: None,
            logging: Vec::new(),
            ..self.clone()
        }
    }

    /// Drop the body in place.
    pub fn strip_body(&mut self) {
        self.samples = None;
        self.reductions = None;
        self.logging.clear();
    }

    /// Find one (id, epoch) pair in a loaded body.
    pub fn sample(&self, id: &SampleId, epoch: u32) -> Option<&EvalSample> {
        self.samples
            .as_ref()?
            .iter()
            .find(|s| &s.id == id && s.epoch == epoch)
    }

    /// Unique sample ids in body order.
    pub fn body_sample_ids(&self) -> Option<Vec<SampleId>> {
        let samples = self.samples.as_ref()?;
        let mut seen = std::collections::HashSet::new();
        Some(
            samples
                .iter()
                .filter(|s| seen.insert(s.id.clone()))
                .map(|s| s.id.clone())
                .collect(),
        )
    }

    /// (id, epoch) pairs listed in the header but missing from the body.
    ///
    /// Empty when the header has no sample-id index or no body is loaded.
    pub fn missing_samples(&self) -> Vec<(SampleId, u32)> {
        let (Some(ids), Some(_)) = (&self.eval.dataset.sample_ids, &self.samples) else {
            return Vec::new();
        };
        let epochs = self.eval.config.epochs_or_default();
        let mut missing = Vec::new();
        for id in ids {
            for epoch in 1..=epochs {
                if self.sample(id, epoch).is_none() {
                    missing.push((id.clone(), epoch));
                }
            }
        }
        missing
    }

    /// Whether the body satisfies the header's sample-id index for this status.
    pub fn is_self_consistent(&self) -> bool {
        self.status.allows_partial_body() || self.missing_samples().is_empty()
    }
}
