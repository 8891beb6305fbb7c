//! The inference engine capability interface.
//!
//! Everything the orchestration core needs from a serving backend fits in
//! [`InferenceEngine`]: batched generation, atomic weight installation, a
//! liveness probe, and the sleep/wake pair used when engines share devices
//! with the trainer. Backends implement this trait; the pool and the
//! synchronizer only ever talk through it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SamplingConfig;
use crate::error::Result;
use crate::sync::snapshot::WeightSnapshot;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Sampling parameters forwarded with every generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: usize,
}

impl SamplingParams {
    pub fn from_config(cfg: &SamplingConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_tokens: cfg.max_generate_tokens,
        }
    }

    /// Deterministic decoding, used for evaluation runs.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens,
        }
    }
}

/// One prompt awaiting its next continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Trajectory this turn belongs to.
    pub trajectory_id: Uuid,
    /// Full prompt context for the turn (task plus prior turns).
    pub prompt: String,
    /// Weight version the caller expects the engine to serve. Engines
    /// reject requests tagged with a version they have not acknowledged.
    pub weight_version: u64,
    pub sampling: SamplingParams,
}

/// A generated continuation for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub trajectory_id: Uuid,
    /// The generated text.
    pub text: String,
    /// Version of the weights that produced this output.
    pub weight_version: u64,
    /// Tokens in the continuation, as counted by the engine.
    pub tokens: usize,
}

/// How a weight snapshot arrives at an engine.
#[derive(Debug, Clone)]
pub enum WeightUpdate {
    /// Shared in memory; the collective transport hands every engine the
    /// same allocation.
    Shared(Arc<WeightSnapshot>),
    /// CBOR payload shipped over the wire by the serialized transport.
    /// The version rides alongside so registries can record it without
    /// decoding.
    Encoded { version: u64, bytes: Arc<Vec<u8>> },
}

impl WeightUpdate {
    /// Version of the snapshot carried by this update.
    pub fn version(&self) -> u64 {
        match self {
            WeightUpdate::Shared(snapshot) => snapshot.version,
            WeightUpdate::Encoded { version, .. } => *version,
        }
    }

    /// Materialize the full snapshot, decoding if necessary.
    pub fn into_snapshot(self) -> Result<WeightSnapshot> {
        match self {
            WeightUpdate::Shared(snapshot) => Ok((*snapshot).clone()),
            WeightUpdate::Encoded { bytes, .. } => WeightSnapshot::from_bytes(&bytes),
        }
    }
}

/// Where an engine replica lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineAddress {
    /// In-process replica.
    Local { replica: usize },
    /// Replica reachable over HTTP.
    Remote { url: String },
}

impl fmt::Display for EngineAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineAddress::Local { replica } => write!(f, "local:{replica}"),
            EngineAddress::Remote { url } => write!(f, "{url}"),
        }
    }
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

/// A text-generation engine replica serving the current policy.
///
/// Object-safe so the pool can hold mixed backends behind `Box<dyn _>`.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Generate continuations for a batch of prompts in one call. Callers
    /// dispatch a singleton batch when running in async-engine mode.
    async fn generate(&self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationOutput>>;

    /// Install a weight snapshot atomically. Returning `Ok` is the ack;
    /// the returned value is the version now being served.
    async fn apply_weights(&self, update: WeightUpdate) -> Result<u64>;

    /// Cheap liveness probe.
    async fn healthcheck(&self) -> Result<()>;

    /// Release device memory while the trainer runs. Only meaningful when
    /// trainer and engines are colocated.
    async fn sleep(&self) -> Result<()>;

    /// Reclaim device memory before the next generation phase.
    async fn wake(&self) -> Result<()>;

    /// Tensor-parallel degree of this replica.
    fn tp_size(&self) -> usize;

    /// Where this replica lives.
    fn address(&self) -> EngineAddress;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::snapshot::WeightShard;

    #[test]
    fn test_greedy_sampling_params() {
        let params = SamplingParams::greedy(128);
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.max_tokens, 128);
    }

    #[test]
    fn test_weight_update_version_without_decode() {
        let snapshot = WeightSnapshot::new(7, vec![WeightShard::new("w", vec![1.0])]);
        let bytes = snapshot.to_bytes().unwrap();

        let shared = WeightUpdate::Shared(Arc::new(snapshot.clone()));
        assert_eq!(shared.version(), 7);

        let encoded = WeightUpdate::Encoded {
            version: 7,
            bytes: Arc::new(bytes),
        };
        assert_eq!(encoded.version(), 7);
        assert_eq!(encoded.into_snapshot().unwrap(), snapshot);
    }

    #[test]
    fn test_engine_address_display() {
        let local = EngineAddress::Local { replica: 2 };
        assert_eq!(local.to_string(), "local:2");

        let remote = EngineAddress::Remote {
            url: "http://10.0.0.5:8000".into(),
        };
        assert_eq!(remote.to_string(), "http://10.0.0.5:8000");
    }

    #[test]
    fn test_generation_request_serde_round_trip() {
        let request = GenerationRequest {
            trajectory_id: Uuid::new_v4(),
            prompt: "fix the failing test".into(),
            weight_version: 3,
            sampling: SamplingParams::greedy(64),
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: GenerationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trajectory_id, request.trajectory_id);
        assert_eq!(back.weight_version, 3);
    }
}
