//! Model handles.
//!
//! Provider clients live outside this crate; the scheduler only needs a
//! name, the connection budget and a way to generate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use evalrun_log::{ChatMessage, GenerateConfig, ModelOutput};
use serde_json::{Map, Value};

use crate::error::RunResult;

/// Connections used per model when neither the caller nor the provider says otherwise.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// A model provider client.
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Concurrent requests the provider tolerates.
    fn max_connections(&self) -> usize {
        DEFAULT_MAX_CONNECTIONS
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        config: &GenerateConfig,
    ) -> RunResult<ModelOutput>;
}

/// A named model bound to its provider client and generation defaults.
#[derive(Clone)]
pub struct ModelRef {
    pub name: String,
    pub base_url: Option<String>,
    pub args: Map<String, Value>,
    pub config: GenerateConfig,
    api: Arc<dyn ModelApi>,
}

impl fmt::Debug for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRef")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModelRef {
    pub fn new(name: impl Into<String>, api: Arc<dyn ModelApi>) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            args: Map::new(),
            config: GenerateConfig::default(),
            api,
        }
    }

    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    /// Configured connection budget, else the provider's.
    pub fn max_connections(&self) -> usize {
        self.config
            .max_connections
            .unwrap_or_else(|| self.api.max_connections())
            .max(1)
    }

    pub fn api(&self) -> &Arc<dyn ModelApi> {
        &self.api
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        config: &GenerateConfig,
    ) -> RunResult<ModelOutput> {
        self.api.generate(messages, config).await
    }
}

/// Builds model handles from the name recorded in a log.
pub trait ModelResolver: Send + Sync {
    fn resolve_model(
        &self,
        name: &str,
        base_url: Option<&str>,
        args: &Map<String, Value>,
        config: &GenerateConfig,
    ) -> RunResult<ModelRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ModelApi for Echo {
        fn max_connections(&self) -> usize {
            4
        }

        async fn generate(
            &self,
            messages: &[ChatMessage],
            _config: &GenerateConfig,
        ) -> RunResult<ModelOutput> {
            Ok(ModelOutput {
                completion: messages
                    .last()
                    .map(|m| m.content.text())
                    .unwrap_or_default(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn connection_budget_prefers_config() {
        let model = ModelRef::new("mock/echo", Arc::new(Echo));
        assert_eq!(model.max_connections(), 4);
        let model = model.with_config(GenerateConfig {
            max_connections: Some(2),
            ..Default::default()
        });
        assert_eq!(model.max_connections(), 2);
    }

    #[tokio::test]
    async fn generate_delegates_to_api() {
        let model = ModelRef::new("mock/echo", Arc::new(Echo));
        let out = model
            .generate(&[ChatMessage::user("ping")], &GenerateConfig::default())
            .await
            .unwrap();
        assert_eq!(out.completion, "ping");
    }
}
