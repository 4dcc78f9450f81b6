//! Run-wide configuration persisted in the log header.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sample::SampleId;

/// Dataset limit: a count from the start or an explicit `[start, end)` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleLimit {
    Count(usize),
    Range(usize, usize),
}

impl SampleLimit {
    /// Index range this limit selects from a dataset of `len` samples.
    pub fn bounds(&self, len: usize) -> std::ops::Range<usize> {
        match *self {
            SampleLimit::Count(n) => 0..n.min(len),
            SampleLimit::Range(start, end) => start.min(len)..end.min(len).max(start.min(len)),
        }
    }
}

/// Explicit sample selection by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleSelection {
    One(SampleId),
    Many(Vec<SampleId>),
}

impl SampleSelection {
    pub fn contains(&self, id: &SampleId) -> bool {
        match self {
            SampleSelection::One(one) => one == id,
            SampleSelection::Many(many) => many.contains(id),
        }
    }
}

/// Sample error policy.
///
/// `true` fails on the first error, `false` never fails, a value in `(0, 1)`
/// is a proportion of total samples, and a value `>= 1` is an absolute count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailOnError {
    Flag(bool),
    Threshold(f64),
}

impl Default for FailOnError {
    fn default() -> Self {
        FailOnError::Flag(true)
    }
}

impl FailOnError {
    /// Whether `errors` failures out of `total` samples should fail the task.
    pub fn should_fail(&self, errors: usize, total: usize) -> bool {
        if errors == 0 {
            return false;
        }
        match *self {
            FailOnError::Flag(flag) => flag,
            FailOnError::Threshold(t) if t < 1.0 => {
                total > 0 && (errors as f64 / total as f64) >= t
            }
            FailOnError::Threshold(t) => errors as f64 >= t,
        }
    }
}

/// Run-wide limits and policies.
///
/// Every field is optional so a header records exactly what the caller set;
/// defaults are applied by the scheduler at use sites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<SampleLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<SampleSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs_reducer: Option<Vec<String>>,
    /// Approval policy reference (opaque to the scheduler).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_error: Option<FailOnError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u64>,
    /// Seconds of wall-clock time per sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    /// Seconds of working time per sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tasks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subprocesses: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sandboxes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_cleanup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_samples: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_images: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_buffer: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_display: Option<bool>,
}

impl EvalConfig {
    pub fn epochs_or_default(&self) -> u32 {
        self.epochs.unwrap_or(1)
    }

    pub fn fail_on_error_or_default(&self) -> FailOnError {
        self.fail_on_error.unwrap_or_default()
    }

    pub fn log_samples_or_default(&self) -> bool {
        self.log_samples.unwrap_or(true)
    }
}

/// Model generation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_seqs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_choices: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_output: Option<u64>,
}

impl GenerateConfig {
    /// Merge `other` into a copy of `self`; set fields of `other` win.
    pub fn merge(&self, other: &GenerateConfig) -> GenerateConfig {
        GenerateConfig {
            max_retries: other.max_retries.or(self.max_retries),
            timeout: other.timeout.or(self.timeout),
            max_connections: other.max_connections.or(self.max_connections),
            system_message: other
                .system_message
                .clone()
                .or_else(|| self.system_message.clone()),
            max_tokens: other.max_tokens.or(self.max_tokens),
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            top_k: other.top_k.or(self.top_k),
            seed: other.seed.or(self.seed),
            stop_seqs: other.stop_seqs.clone().or_else(|| self.stop_seqs.clone()),
            num_choices: other.num_choices.or(self.num_choices),
            max_tool_output: other.max_tool_output.or(self.max_tool_output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_on_error_flag() {
        assert!(FailOnError::Flag(true).should_fail(1, 100));
        assert!(!FailOnError::Flag(true).should_fail(0, 100));
        assert!(!FailOnError::Flag(false).should_fail(100, 100));
    }

    #[test]
    fn fail_on_error_proportion() {
        let policy = FailOnError::Threshold(0.1);
        assert!(!policy.should_fail(9, 100));
        assert!(policy.should_fail(10, 100));
    }

    #[test]
    fn fail_on_error_count() {
        let policy = FailOnError::Threshold(5.0);
        assert!(!policy.should_fail(4, 10));
        assert!(policy.should_fail(5, 10));
    }

    #[test]
    fn fail_on_error_untagged_serde() {
        let flag: FailOnError = serde_json::from_str("false").expect("bool");
        assert_eq!(flag, FailOnError::Flag(false));
        let prop: FailOnError = serde_json::from_str("0.2").expect("float");
        assert_eq!(prop, FailOnError::Threshold(0.2));
    }

    #[test]
    fn sample_limit_bounds() {
        assert_eq!(SampleLimit::Count(3).bounds(10), 0..3);
        assert_eq!(SampleLimit::Count(30).bounds(10), 0..10);
        assert_eq!(SampleLimit::Range(2, 5).bounds(10), 2..5);
        assert_eq!(SampleLimit::Range(8, 20).bounds(10), 8..10);
        assert_eq!(SampleLimit::Range(12, 20).bounds(10), 10..10);
    }

    #[test]
    fn sample_limit_range_serializes_as_pair() {
        let json = serde_json::to_string(&SampleLimit::Range(1, 4)).expect("serialize");
        assert_eq!(json, "[1,4]");
        let back: SampleLimit = serde_json::from_str("[1,4]").expect("deserialize");
        assert_eq!(back, SampleLimit::Range(1, 4));
    }

    #[test]
    fn eval_config_omits_unset_fields() {
        let config = EvalConfig {
            max_samples: Some(4),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json, serde_json::json!({"max_samples": 4}));
    }

    #[test]
    fn generate_config_merge_prefers_other() {
        let base = GenerateConfig {
            max_retries: Some(5),
            timeout: Some(30),
            temperature: Some(0.2),
            ..Default::default()
        };
        let overrides = GenerateConfig {
            timeout: Some(120),
            ..Default::default()
        };
        let merged = base.merge(&overrides);
        assert_eq!(merged.max_retries, Some(5));
        assert_eq!(merged.timeout, Some(120));
        assert_eq!(merged.temperature, Some(0.2));
    }
}
