//! The engine pool: the single authoritative registry of engine replicas.
//!
//! All membership and health state lives here. Dispatch never mutates a
//! handle directly; it works from read-only [`EngineView`] snapshots and
//! reports outcomes back through the pool's transition methods
//! ([`EnginePool::record_ack`], [`EnginePool::mark_unhealthy`]).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::api::{EngineAddress, InferenceEngine};

/// Identifier of a registered engine, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineId(pub usize);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Read-only snapshot of one registered engine, safe to hold across awaits.
#[derive(Clone)]
pub struct EngineView {
    pub id: EngineId,
    pub engine: Arc<dyn InferenceEngine>,
    pub tp_size: usize,
    pub address: EngineAddress,
    /// Last weight version this engine acknowledged.
    pub weight_version: u64,
    pub healthy: bool,
}

impl fmt::Debug for EngineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineView")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("weight_version", &self.weight_version)
            .field("healthy", &self.healthy)
            .finish()
    }
}

struct EngineEntry {
    engine: Arc<dyn InferenceEngine>,
    weight_version: u64,
    healthy: bool,
}

/// Registry of engine replicas with health and version bookkeeping.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<RwLock<Vec<EngineEntry>>>,
}

impl EnginePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a replica. Engines start healthy at version 0 (the initial
    /// sync moves them to the trainer's version before any dispatch).
    pub async fn register(&self, engine: Arc<dyn InferenceEngine>) -> EngineId {
        let mut entries = self.inner.write().await;
        let id = EngineId(entries.len());
        tracing::info!(engine = %id, address = %engine.address(), "Registered inference engine");
        entries.push(EngineEntry {
            engine,
            weight_version: 0,
            healthy: true,
        });
        id
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn healthy_count(&self) -> usize {
        self.inner.read().await.iter().filter(|e| e.healthy).count()
    }

    /// Snapshot every registered engine, healthy or not.
    pub async fn views(&self) -> Vec<EngineView> {
        let entries = self.inner.read().await;
        entries
            .iter()
            .enumerate()
            .map(|(i, e)| EngineView {
                id: EngineId(i),
                engine: Arc::clone(&e.engine),
                tp_size: e.engine.tp_size(),
                address: e.engine.address(),
                weight_version: e.weight_version,
                healthy: e.healthy,
            })
            .collect()
    }

    /// Snapshot only the engines eligible for dispatch.
    pub async fn healthy_views(&self) -> Vec<EngineView> {
        self.views().await.into_iter().filter(|v| v.healthy).collect()
    }

    /// Route a trajectory to a healthy engine by stable hash, so a given
    /// trajectory keeps hitting the same replica while the pool membership
    /// is unchanged.
    pub async fn route(&self, trajectory_id: Uuid) -> Option<EngineView> {
        let healthy = self.healthy_views().await;
        if healthy.is_empty() {
            return None;
        }
        let slot = (trajectory_id.as_u128() % healthy.len() as u128) as usize;
        Some(healthy[slot].clone())
    }

    /// Record a successful weight acknowledgement. A previously unhealthy
    /// engine that acks is folded back into the dispatch set.
    pub async fn record_ack(&self, id: EngineId, version: u64) {
        let mut entries = self.inner.write().await;
        if let Some(entry) = entries.get_mut(id.0) {
            if !entry.healthy {
                tracing::info!(engine = %id, version, "Engine restored to healthy after ack");
            }
            entry.weight_version = version;
            entry.healthy = true;
        }
    }

    /// Exclude an engine from dispatch until it acknowledges a later sync.
    pub async fn mark_unhealthy(&self, id: EngineId) {
        let mut entries = self.inner.write().await;
        if let Some(entry) = entries.get_mut(id.0) {
            if entry.healthy {
                tracing::warn!(engine = %id, "Engine marked unhealthy");
            }
            entry.healthy = false;
        }
    }

    /// Weight version last acknowledged by an engine.
    pub async fn version_of(&self, id: EngineId) -> Option<u64> {
        self.inner.read().await.get(id.0).map(|e| e.weight_version)
    }

    /// Put every healthy engine to sleep (colocated training phase).
    pub async fn sleep_all(&self) -> crate::error::Result<()> {
        for view in self.healthy_views().await {
            view.engine.sleep().await?;
        }
        Ok(())
    }

    /// Wake every healthy engine before the next generation phase.
    pub async fn wake_all(&self) -> crate::error::Result<()> {
        for view in self.healthy_views().await {
            view.engine.wake().await?;
        }
        Ok(())
    }
}

impl Default for EnginePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::api::{GenerationOutput, GenerationRequest, WeightUpdate};
    use crate::error::Result;
    use async_trait::async_trait;

    /// Trivial engine that echoes prompts. Enough to exercise the registry.
    struct StubEngine {
        replica: usize,
    }

    #[async_trait]
    impl InferenceEngine for StubEngine {
        async fn generate(
            &self,
            requests: Vec<GenerationRequest>,
        ) -> Result<Vec<GenerationOutput>> {
            Ok(requests
                .into_iter()
                .map(|r| GenerationOutput {
                    trajectory_id: r.trajectory_id,
                    text: r.prompt,
                    weight_version: r.weight_version,
                    tokens: 1,
                })
                .collect())
        }

        async fn apply_weights(&self, update: WeightUpdate) -> Result<u64> {
            Ok(update.version())
        }

        async fn healthcheck(&self) -> Result<()> {
            Ok(())
        }

        async fn sleep(&self) -> Result<()> {
            Ok(())
        }

        async fn wake(&self) -> Result<()> {
            Ok(())
        }

        fn tp_size(&self) -> usize {
            1
        }

        fn address(&self) -> EngineAddress {
            EngineAddress::Local {
                replica: self.replica,
            }
        }
    }

    async fn pool_of(n: usize) -> EnginePool {
        let pool = EnginePool::new();
        for replica in 0..n {
            pool.register(Arc::new(StubEngine { replica })).await;
        }
        pool
    }

    #[tokio::test]
    async fn test_registration_assigns_sequential_ids() {
        let pool = pool_of(3).await;
        assert_eq!(pool.len().await, 3);
        let views = pool.views().await;
        assert_eq!(views[0].id, EngineId(0));
        assert_eq!(views[2].id, EngineId(2));
        assert!(views.iter().all(|v| v.healthy && v.weight_version == 0));
    }

    #[tokio::test]
    async fn test_unhealthy_engines_excluded_from_dispatch() {
        let pool = pool_of(2).await;
        pool.mark_unhealthy(EngineId(1)).await;

        assert_eq!(pool.healthy_count().await, 1);
        let healthy = pool.healthy_views().await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, EngineId(0));

        // The full view still includes the unhealthy engine: syncs target it.
        assert_eq!(pool.views().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ack_restores_health_and_version() {
        let pool = pool_of(2).await;
        pool.mark_unhealthy(EngineId(0)).await;
        assert_eq!(pool.healthy_count().await, 1);

        pool.record_ack(EngineId(0), 5).await;
        assert_eq!(pool.healthy_count().await, 2);
        assert_eq!(pool.version_of(EngineId(0)).await, Some(5));
    }

    #[tokio::test]
    async fn test_route_is_stable_and_healthy_only() {
        let pool = pool_of(2).await;
        let trajectory = Uuid::new_v4();

        let first = pool.route(trajectory).await.unwrap();
        let second = pool.route(trajectory).await.unwrap();
        assert_eq!(first.id, second.id);

        pool.mark_unhealthy(EngineId(0)).await;
        pool.mark_unhealthy(EngineId(1)).await;
        assert!(pool.route(trajectory).await.is_none());
    }
}
