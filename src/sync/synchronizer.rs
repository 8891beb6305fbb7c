//! The weight synchronizer: trainer-to-pool broadcast after each step.
//!
//! Syncs are strictly sequential (`&mut self`); a new broadcast never starts
//! while the previous one is in flight. Every registered engine is targeted,
//! healthy or not, so an engine that missed a sync rejoins the dispatch set
//! the moment it acknowledges a later one.

use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::time::timeout;

use crate::engine::pool::{EngineId, EnginePool};
use crate::error::{Error, Result};

use super::snapshot::WeightSnapshot;
use super::transport::SyncTransport;

/// Outcome of one broadcast.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Snapshot version that was broadcast.
    pub version: u64,
    /// Engines targeted (the whole registry).
    pub attempted: usize,
    /// Engines that acknowledged within the timeout.
    pub acked: Vec<EngineId>,
    /// Engines that failed or timed out, with the reason.
    pub failed: Vec<(EngineId, String)>,
    pub elapsed: Duration,
}

impl SyncReport {
    /// True when every targeted engine acknowledged.
    pub fn is_full(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when the pool lost capacity this sync.
    pub fn degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Broadcasts weight snapshots and keeps the pool's health bookkeeping.
pub struct WeightSynchronizer {
    pool: EnginePool,
    transport: SyncTransport,
    ack_timeout: Duration,
    syncs_completed: u64,
}

impl WeightSynchronizer {
    pub fn new(pool: EnginePool, transport: SyncTransport, ack_timeout: Duration) -> Self {
        Self {
            pool,
            transport,
            ack_timeout,
            syncs_completed: 0,
        }
    }

    /// Number of broadcasts that returned successfully (full or degraded).
    pub fn syncs_completed(&self) -> u64 {
        self.syncs_completed
    }

    /// Broadcast `snapshot` to every registered engine and wait for acks.
    ///
    /// Per-engine failures degrade the pool; zero acknowledgements are fatal
    /// because no engine can serve the current policy anymore.
    pub async fn sync(&mut self, snapshot: &WeightSnapshot) -> Result<SyncReport> {
        let started = Instant::now();
        let views = self.pool.views().await;
        if views.is_empty() {
            return Err(Error::SyncFailed { attempted: 0 });
        }

        let prepared = self.transport.prepare(snapshot.clone())?;
        tracing::debug!(
            version = prepared.version(),
            engines = views.len(),
            wire_bytes = ?prepared.wire_bytes(),
            "Broadcasting weight snapshot"
        );

        let ack_timeout = self.ack_timeout;
        let calls = views.iter().map(|view| {
            let update = prepared.update();
            let engine = view.engine.clone();
            async move { timeout(ack_timeout, engine.apply_weights(update)).await }
        });
        let outcomes = join_all(calls).await;

        let mut report = SyncReport {
            version: snapshot.version,
            attempted: views.len(),
            acked: Vec::new(),
            failed: Vec::new(),
            elapsed: Duration::ZERO,
        };

        for (view, outcome) in views.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(acked_version)) if acked_version == snapshot.version => {
                    self.pool.record_ack(view.id, acked_version).await;
                    report.acked.push(view.id);
                }
                Ok(Ok(acked_version)) => {
                    // An ack for the wrong version counts as a failure; the
                    // engine's installed state is not what we broadcast.
                    let reason = format!(
                        "acked version {acked_version}, expected {}",
                        snapshot.version
                    );
                    tracing::warn!(engine = %view.id, %reason, "Weight sync rejected ack");
                    self.pool.mark_unhealthy(view.id).await;
                    report.failed.push((view.id, reason));
                }
                Ok(Err(e)) => {
                    tracing::warn!(engine = %view.id, error = %e, "Weight sync failed");
                    self.pool.mark_unhealthy(view.id).await;
                    report.failed.push((view.id, e.to_string()));
                }
                Err(_) => {
                    let e = Error::SyncTimeout {
                        engine: view.id.to_string(),
                    };
                    tracing::warn!(engine = %view.id, error = %e, "Weight sync timed out");
                    self.pool.mark_unhealthy(view.id).await;
                    report.failed.push((view.id, e.to_string()));
                }
            }
        }

        report.elapsed = started.elapsed();

        if report.acked.is_empty() {
            return Err(Error::SyncFailed {
                attempted: report.attempted,
            });
        }

        self.syncs_completed += 1;
        if report.degraded() {
            tracing::warn!(
                version = report.version,
                acked = report.acked.len(),
                failed = report.failed.len(),
                "Weight sync degraded; continuing with reduced capacity"
            );
        } else {
            tracing::info!(
                version = report.version,
                engines = report.acked.len(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Weight sync complete"
            );
        }
        Ok(report)
    }
}
