//! Bounded concurrency pools.
//!
//! Four kinds of pool: task slots, per-task sample slots, subprocess slots
//! and per-provider sandbox slots. Each pool is a fair (FIFO) semaphore;
//! a [`Lease`] holds one permit and gives it back when dropped, so a lease
//! is released exactly once on every exit path, cancellation included.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use evalrun_log::EvalConfig;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{RunError, RunResult};
use crate::model::DEFAULT_MAX_CONNECTIONS;

/// Identifies one pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    Tasks,
    /// Sample slots of one task, keyed by task id.
    Samples(String),
    Subprocesses,
    /// Sandbox slots of one provider.
    Sandboxes(String),
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::Tasks => f.write_str("tasks"),
            PoolKey::Samples(task) => write!(f, "samples[{task}]"),
            PoolKey::Subprocesses => f.write_str("subprocesses"),
            PoolKey::Sandboxes(provider) => write!(f, "sandboxes[{provider}]"),
        }
    }
}

/// Host CPU count, at least 1.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Sandbox slots for a provider that declares no default.
pub fn default_sandbox_capacity() -> usize {
    cpu_count() * 2
}

/// A single bounded pool.
#[derive(Debug)]
pub struct Pool {
    key: PoolKey,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_use: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Pool {
    fn new(key: PoolKey, capacity: usize) -> RunResult<Self> {
        if capacity == 0 {
            return Err(RunError::InvalidCapacity {
                pool: key.to_string(),
            });
        }
        Ok(Self {
            key,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_use: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Leases currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest number of leases ever held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> RunResult<Lease> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RunError::PoolClosed(self.key.to_string()))?;
        let held = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(held, Ordering::AcqRel);
        trace!(pool = %self.key, held, "lease acquired");
        Ok(Lease {
            _permit: permit,
            in_use: self.in_use.clone(),
        })
    }
}

/// One held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Lease {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Caps a run was configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GovernorLimits {
    pub max_tasks: Option<usize>,
    pub max_subprocesses: Option<usize>,
    pub max_sandboxes: Option<usize>,
    /// Distinct models in the run; the task-slot default.
    pub model_count: usize,
}

impl GovernorLimits {
    pub fn from_config(config: &EvalConfig, model_count: usize) -> Self {
        Self {
            max_tasks: config.max_tasks,
            max_subprocesses: config.max_subprocesses,
            max_sandboxes: config.max_sandboxes,
            model_count,
        }
    }
}

/// Owns every pool of a run.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    limits: GovernorLimits,
    sandbox_defaults: HashMap<String, usize>,
    pools: Mutex<HashMap<PoolKey, Arc<Pool>>>,
}

impl ConcurrencyGovernor {
    /// Fails fast on any explicit zero capacity.
    pub fn new(limits: GovernorLimits) -> RunResult<Self> {
        for (key, cap) in [
            (PoolKey::Tasks, limits.max_tasks),
            (PoolKey::Subprocesses, limits.max_subprocesses),
            (PoolKey::Sandboxes("*".to_string()), limits.max_sandboxes),
        ] {
            if cap == Some(0) {
                return Err(RunError::InvalidCapacity {
                    pool: key.to_string(),
                });
            }
        }
        Ok(Self {
            limits,
            sandbox_defaults: HashMap::new(),
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Provider-supplied sandbox capacity, used unless `max_sandboxes` is set.
    pub fn with_sandbox_default(mut self, provider: impl Into<String>, capacity: usize) -> Self {
        self.sandbox_defaults.insert(provider.into(), capacity);
        self
    }

    pub fn limits(&self) -> &GovernorLimits {
        &self.limits
    }

    /// Capacity a pool gets when nobody configured it explicitly.
    pub fn default_capacity(&self, key: &PoolKey) -> usize {
        match key {
            PoolKey::Tasks => self.limits.max_tasks.unwrap_or(self.limits.model_count.max(1)),
            PoolKey::Samples(_) => DEFAULT_MAX_CONNECTIONS,
            PoolKey::Subprocesses => self.limits.max_subprocesses.unwrap_or_else(cpu_count),
            PoolKey::Sandboxes(provider) => self.limits.max_sandboxes.unwrap_or_else(|| {
                self.sandbox_defaults
                    .get(provider)
                    .copied()
                    .unwrap_or_else(default_sandbox_capacity)
            }),
        }
    }

    /// Create `key` with `capacity`. An existing pool is returned unchanged.
    pub fn configure(&self, key: PoolKey, capacity: usize) -> RunResult<Arc<Pool>> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(Pool::new(key.clone(), capacity)?);
        debug!(pool = %key, capacity, "pool created");
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// The pool for `key`, created with its default capacity on first use.
    pub fn pool(&self, key: &PoolKey) -> RunResult<Arc<Pool>> {
        let capacity = self.default_capacity(key);
        self.configure(key.clone(), capacity)
    }

    /// Wait for a slot in `key`.
    pub async fn acquire(&self, key: &PoolKey) -> RunResult<Lease> {
        self.pool(key)?.acquire().await
    }

    /// Drop a pool once its owner is done with it. Held leases stay valid.
    pub fn release_pool(&self, key: &PoolKey) {
        self.pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn governor() -> ConcurrencyGovernor {
        ConcurrencyGovernor::new(GovernorLimits {
            model_count: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn zero_capacity_fails_fast() {
        let err = ConcurrencyGovernor::new(GovernorLimits {
            max_subprocesses: Some(0),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RunError::InvalidCapacity { .. }));

        let err = governor()
            .configure(PoolKey::Samples("t".into()), 0)
            .unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn defaults() {
        let gov = governor().with_sandbox_default("docker", 3);
        assert_eq!(gov.default_capacity(&PoolKey::Tasks), 2);
        assert_eq!(gov.default_capacity(&PoolKey::Subprocesses), cpu_count());
        assert_eq!(gov.default_capacity(&PoolKey::Sandboxes("docker".into())), 3);
        assert_eq!(
            gov.default_capacity(&PoolKey::Sandboxes("k8s".into())),
            default_sandbox_capacity()
        );

        let capped = ConcurrencyGovernor::new(GovernorLimits {
            max_sandboxes: Some(5),
            ..Default::default()
        })
        .unwrap()
        .with_sandbox_default("docker", 3);
        assert_eq!(capped.default_capacity(&PoolKey::Sandboxes("docker".into())), 5);
    }

    #[test]
    fn sandbox_pools_are_per_provider() {
        let gov = governor();
        let docker = gov.pool(&PoolKey::Sandboxes("docker".into())).unwrap();
        let local = gov.pool(&PoolKey::Sandboxes("local".into())).unwrap();
        assert!(!Arc::ptr_eq(&docker, &local));
        let again = gov.pool(&PoolKey::Sandboxes("docker".into())).unwrap();
        assert!(Arc::ptr_eq(&docker, &again));
    }

    #[tokio::test]
    async fn lease_released_on_drop() {
        let gov = governor();
        let pool = gov.configure(PoolKey::Samples("t".into()), 1).unwrap();
        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 1);
        drop(lease);
        assert_eq!(pool.in_use(), 0);
        let _again = pool.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_leak() {
        let gov = governor();
        let pool = gov.configure(PoolKey::Subprocesses, 1).unwrap();
        let held = pool.acquire().await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(waited.is_err());

        drop(held);
        assert_eq!(pool.in_use(), 0);
        let lease = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn slots_granted_in_request_order() {
        let gov = governor();
        let pool = gov.configure(PoolKey::Tasks, 1).unwrap();
        let first = pool.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _lease = pool.acquire().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next is spawned.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
