//! Inference engine abstractions and the engine pool.
//!
//! This module provides:
//! - [`api::InferenceEngine`] -- the capability trait every serving backend
//!   implements (generate, atomic weight install, healthcheck, sleep/wake).
//! - [`pool::EnginePool`] -- the authoritative registry holding health and
//!   weight-version state, handing out read-only [`pool::EngineView`]
//!   snapshots for dispatch.
//! - [`local::LocalEngine`] -- deterministic in-process replica with failure
//!   and latency injection.
//! - [`http::HttpEngine`] -- client for replicas served over HTTP.

pub mod api;
pub mod http;
pub mod local;
pub mod pool;

// Re-export the most commonly used items at the module level.
pub use api::{
    EngineAddress, GenerationOutput, GenerationRequest, InferenceEngine, SamplingParams,
    WeightUpdate,
};
pub use http::HttpEngine;
pub use local::LocalEngine;
pub use pool::{EngineId, EnginePool, EngineView};
