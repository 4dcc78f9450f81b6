//! Per-sample records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Dataset sample identifier (integer or string).
///
/// Integers order before strings so mixed-id datasets sort deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleId {
    Int(i64),
    Str(String),
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleId::Int(i) => write!(f, "{i}"),
            SampleId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SampleId {
    fn from(value: i64) -> Self {
        SampleId::Int(value)
    }
}

impl From<&str> for SampleId {
    fn from(value: &str) -> Self {
        SampleId::Str(value.to_string())
    }
}

impl From<String> for SampleId {
    fn from(value: String) -> Self {
        SampleId::Str(value)
    }
}

/// Chat role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Image as URL or `data:` URI.
    Image { image: String },
}

/// Message content: plain text or a list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A single chat message in a sample transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            source: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }
}

/// Token usage for model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl ModelUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Final model output of a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub model: String,
    pub completion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
}

/// A scorer's verdict on one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Score {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            answer: None,
            explanation: None,
        }
    }

    /// Numeric view of the score value.
    ///
    /// Letter grades map as `C` = 1, `P` = 0.5, `I` = 0; booleans and
    /// yes/no strings map to 1/0. Anything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "c" | "yes" | "true" | "correct" => Some(1.0),
                "p" | "partial" => Some(0.5),
                "i" | "no" | "false" | "incorrect" => Some(0.0),
                other => other.parse::<f64>().ok(),
            },
            _ => None,
        }
    }
}

/// Error captured on a sample or a log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalError {
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub traceback: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: String::new(),
        }
    }
}

/// Which per-sample limit stopped a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Message,
    Token,
    Time,
    Working,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitKind::Message => "message",
            LimitKind::Token => "token",
            LimitKind::Time => "time",
            LimitKind::Working => "working",
        };
        f.write_str(s)
    }
}

/// Record of a limit that terminated a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleLimitExceeded {
    #[serde(rename = "type")]
    pub kind: LimitKind,
    pub limit: f64,
}

/// Outcome of one (sample id, epoch) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSample {
    pub id: SampleId,
    pub epoch: u32,
    pub input: Value,
    #[serde(default)]
    pub target: Value,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ModelOutput>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, Score>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub store: Map<String, Value>,
    /// Transcript events recorded while the sample ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_usage: BTreeMap<String, ModelUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EvalError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<SampleLimitExceeded>,
    /// Content-hash keyed attachments referenced as `attachment://<hash>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, String>,
}

impl EvalSample {
    pub fn new(id: impl Into<SampleId>, epoch: u32, input: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            epoch,
            input: input.into(),
            target: Value::Null,
            messages: Vec::new(),
            output: None,
            scores: BTreeMap::new(),
            metadata: Map::new(),
            store: Map::new(),
            events: Vec::new(),
            model_usage: BTreeMap::new(),
            total_time: None,
            working_time: None,
            error: None,
            limit: None,
            attachments: BTreeMap::new(),
        }
    }

    /// Compact projection written to the journal on each flush.
    pub fn summary(&self) -> SampleSummary {
        SampleSummary {
            id: self.id.clone(),
            epoch: self.epoch,
            scores: self.scores.clone(),
            error: self.error.as_ref().map(|e| e.message.clone()),
            limit: self.limit.map(|l| l.kind.to_string()),
        }
    }
}

/// Journal entry for a flushed sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub id: SampleId,
    pub epoch: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_id_untagged_serde() {
        let ids = vec![SampleId::Int(3), SampleId::from("abc")];
        let json = serde_json::to_string(&ids).expect("serialize");
        assert_eq!(json, r#"[3,"abc"]"#);
        let back: Vec<SampleId> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ids);
    }

    #[test]
    fn sample_id_orders_ints_before_strings() {
        let mut ids = vec![
            SampleId::from("b"),
            SampleId::Int(10),
            SampleId::from("a"),
            SampleId::Int(2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                SampleId::Int(2),
                SampleId::Int(10),
                SampleId::from("a"),
                SampleId::from("b"),
            ]
        );
    }

    #[test]
    fn score_numeric_views() {
        assert_eq!(Score::new(0.25).as_f64(), Some(0.25));
        assert_eq!(Score::new(true).as_f64(), Some(1.0));
        assert_eq!(Score::new("C").as_f64(), Some(1.0));
        assert_eq!(Score::new("I").as_f64(), Some(0.0));
        assert_eq!(Score::new("P").as_f64(), Some(0.5));
        assert_eq!(Score::new("maybe").as_f64(), None);
    }

    #[test]
    fn message_content_text_skips_images() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "look".to_string(),
            },
            ContentPart::Image {
                image: "data:image/png;base64,AAAA".to_string(),
            },
        ]);
        assert_eq!(content.text(), "look");
    }

    #[test]
    fn empty_collections_are_omitted() {
        let sample = EvalSample::new(1, 1, "hi");
        let value = serde_json::to_value(&sample).expect("serialize");
        let obj = value.as_object().expect("object");
        assert!(!obj.contains_key("scores"));
        assert!(!obj.contains_key("attachments"));
        assert!(!obj.contains_key("error"));
    }

    #[test]
    fn summary_carries_error_and_limit() {
        let mut sample = EvalSample::new("x", 2, "hi");
        sample.error = Some(EvalError::new("boom"));
        sample.limit = Some(SampleLimitExceeded {
            kind: LimitKind::Token,
            limit: 100.0,
        });
        let summary = sample.summary();
        assert_eq!(summary.error.as_deref(), Some("boom"));
        assert_eq!(summary.limit.as_deref(), Some("token"));
        assert_eq!(summary.epoch, 2);
    }
}
