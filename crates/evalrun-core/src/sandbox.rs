//! Sandbox provider hooks.
//!
//! Backends (containers, VMs) live elsewhere. A provider declares its
//! default concurrency and gets per-sample setup and teardown calls while
//! the sample holds a sandbox slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use evalrun_log::{SampleId, SandboxSpec};

use crate::error::RunResult;
use crate::governor::default_sandbox_capacity;

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider identity matching `SandboxSpec::provider`.
    fn provider(&self) -> &str;

    fn default_concurrency(&self) -> usize {
        default_sandbox_capacity()
    }

    async fn sample_init(&self, _spec: &SandboxSpec, _id: &SampleId, _epoch: u32) -> RunResult<()> {
        Ok(())
    }

    /// Called after the sample finishes. `cleanup` is false when
    /// environments should be left in place for inspection.
    async fn sample_cleanup(
        &self,
        _spec: &SandboxSpec,
        _id: &SampleId,
        _epoch: u32,
        _cleanup: bool,
    ) -> RunResult<()> {
        Ok(())
    }
}

/// Providers known to a scheduler.
#[derive(Clone, Default)]
pub struct SandboxProviders {
    providers: BTreeMap<String, Arc<dyn SandboxProvider>>,
}

impl std::fmt::Debug for SandboxProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

impl SandboxProviders {
    pub fn register(&mut self, provider: Arc<dyn SandboxProvider>) {
        self.providers
            .insert(provider.provider().to_string(), provider);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.get(provider).cloned()
    }

    /// (provider, default concurrency) pairs.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, usize)> {
        self.providers
            .iter()
            .map(|(name, p)| (name.as_str(), p.default_concurrency()))
    }
}
