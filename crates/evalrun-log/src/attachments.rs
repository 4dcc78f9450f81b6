//! Content-addressed attachments.
//!
//! Large strings inside a sample (images, long tool output) are moved into
//! the sample's `attachments` map keyed by SHA-256 hex and replaced by an
//! `attachment://<hash>` reference. Resolution is the inverse and only
//! happens on request.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::error::{LogError, LogResult};
use crate::model::{ContentPart, EvalSample, MessageContent};

pub const ATTACHMENT_PROTOCOL: &str = "attachment://";

/// Text longer than this many bytes is moved out of line.
pub const CONDENSE_THRESHOLD: usize = 100;

const IMAGE_PLACEHOLDER: &str = "<image>";

/// SHA-256 content hash of an attachment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDigest([u8; 32]);

impl AttachmentDigest {
    pub fn compute(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for AttachmentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentDigest({})", self.to_hex())
    }
}

impl fmt::Display for AttachmentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Attachment key referenced by `value`, if it is a reference.
pub fn attachment_key(value: &str) -> Option<&str> {
    value.strip_prefix(ATTACHMENT_PROTOCOL)
}

fn is_data_uri(value: &str) -> bool {
    value.starts_with("data:")
}

struct Condenser<'a> {
    attachments: &'a mut BTreeMap<String, String>,
    log_images: bool,
}

impl Condenser<'_> {
    fn string(&mut self, text: &mut String) {
        if attachment_key(text).is_some() {
            return;
        }
        if is_data_uri(text) && !self.log_images {
            *text = IMAGE_PLACEHOLDER.to_string();
            return;
        }
        if is_data_uri(text) || text.len() > CONDENSE_THRESHOLD {
            let content = std::mem::take(text);
            let key = AttachmentDigest::compute(&content).to_hex();
            *text = format!("{ATTACHMENT_PROTOCOL}{key}");
            self.attachments.entry(key).or_insert(content);
        }
    }

    fn value(&mut self, value: &mut Value) {
        match value {
            Value::String(s) => self.string(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.value(v)),
            _ => {}
        }
    }

    fn content(&mut self, content: &mut MessageContent) {
        match content {
            MessageContent::Text(text) => self.string(text),
            MessageContent::Parts(parts) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => self.string(text),
                        ContentPart::Image { image } => self.string(image),
                    }
                }
            }
        }
    }
}

/// Move large content out of line into `sample.attachments`.
///
/// With `log_images` off, inline images are replaced by a placeholder
/// instead of being stored.
pub fn condense_sample(mut sample: EvalSample, log_images: bool) -> EvalSample {
    let mut attachments = std::mem::take(&mut sample.attachments);
    let mut condenser = Condenser {
        attachments: &mut attachments,
        log_images,
    };
    condenser.value(&mut sample.input);
    for message in &mut sample.messages {
        condenser.content(&mut message.content);
    }
    if let Some(output) = &mut sample.output {
        condenser.string(&mut output.completion);
    }
    for event in &mut sample.events {
        condenser.value(event);
    }
    sample.attachments = attachments;
    sample
}

struct Resolver<'a> {
    attachments: &'a BTreeMap<String, String>,
}

impl Resolver<'_> {
    fn string(&self, text: &mut String) -> LogResult<()> {
        if let Some(key) = attachment_key(text) {
            let content = self
                .attachments
                .get(key)
                .ok_or_else(|| LogError::AttachmentNotFound(key.to_string()))?;
            *text = content.clone();
        }
        Ok(())
    }

    fn value(&self, value: &mut Value) -> LogResult<()> {
        match value {
            Value::String(s) => self.string(s),
            Value::Array(items) => items.iter_mut().try_for_each(|v| self.value(v)),
            Value::Object(map) => map.values_mut().try_for_each(|v| self.value(v)),
            _ => Ok(()),
        }
    }

    fn content(&self, content: &mut MessageContent) -> LogResult<()> {
        match content {
            MessageContent::Text(text) => self.string(text),
            MessageContent::Parts(parts) => parts.iter_mut().try_for_each(|part| match part {
                ContentPart::Text { text } => self.string(text),
                ContentPart::Image { image } => self.string(image),
            }),
        }
    }
}

/// Replace every `attachment://` reference with its content and clear the map.
pub fn resolve_sample_attachments(mut sample: EvalSample) -> LogResult<EvalSample> {
    let attachments = std::mem::take(&mut sample.attachments);
    let resolver = Resolver {
        attachments: &attachments,
    };
    resolver.value(&mut sample.input)?;
    for message in &mut sample.messages {
        resolver.content(&mut message.content)?;
    }
    if let Some(output) = &mut sample.output {
        resolver.string(&mut output.completion)?;
    }
    for event in &mut sample.events {
        resolver.value(event)?;
    }
    Ok(sample)
}
