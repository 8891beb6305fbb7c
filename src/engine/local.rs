//! In-process engine replica.
//!
//! Serves deterministic continuations derived from the prompt, the replica
//! seed and the installed weight digest, so orchestration behavior is fully
//! reproducible without a real serving stack. Failure and latency injection
//! hooks let tests script engine misbehavior the same way the scripted
//! environments script task outcomes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::sync::snapshot::{Fnv1a, WeightSnapshot};

use super::api::{
    EngineAddress, GenerationOutput, GenerationRequest, InferenceEngine, WeightUpdate,
};

struct Installed {
    version: u64,
    digest: u64,
    param_count: usize,
}

/// Deterministic in-process engine.
pub struct LocalEngine {
    replica: usize,
    tp_size: usize,
    seed: u64,
    installed: Mutex<Installed>,
    awake: AtomicBool,
    generate_delay: Mutex<Option<Duration>>,
    apply_delay: Mutex<Option<Duration>>,
    failing_generates: AtomicUsize,
    failing_applies: AtomicUsize,
}

impl LocalEngine {
    /// Engines start awake at version 0 with no weights installed; the
    /// initial sync brings them to the trainer's version.
    pub fn new(replica: usize, tp_size: usize, seed: u64) -> Self {
        Self {
            replica,
            tp_size,
            seed,
            installed: Mutex::new(Installed {
                version: 0,
                digest: 0,
                param_count: 0,
            }),
            awake: AtomicBool::new(true),
            generate_delay: Mutex::new(None),
            apply_delay: Mutex::new(None),
            failing_generates: AtomicUsize::new(0),
            failing_applies: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` generation calls with an engine error.
    pub fn fail_next_generates(&self, n: usize) {
        self.failing_generates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` weight installations.
    pub fn fail_next_applies(&self, n: usize) {
        self.failing_applies.store(n, Ordering::SeqCst);
    }

    /// Delay every generation call, e.g. to trip dispatch timeouts.
    pub fn set_generate_delay(&self, delay: Option<Duration>) {
        *self.generate_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Delay every weight installation, e.g. to trip sync ack timeouts.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    fn name(&self) -> String {
        format!("local:{}", self.replica)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn continuation(&self, request: &GenerationRequest, version: u64, digest: u64) -> String {
        let mut hash = Fnv1a::new();
        hash.write(request.prompt.as_bytes());
        hash.write(&self.seed.to_le_bytes());
        hash.write(&digest.to_le_bytes());
        // Nonzero temperature emulates sampling: identical prompts from
        // different trajectories draw different continuations. Greedy
        // decoding stays a pure function of prompt and weights.
        if request.sampling.temperature > 0.0 {
            hash.write(request.trajectory_id.as_bytes());
        }
        format!("action[{:08x}] v{version}", hash.finish() & 0xffff_ffff)
    }
}

#[async_trait]
impl InferenceEngine for LocalEngine {
    async fn generate(&self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationOutput>> {
        if !self.awake.load(Ordering::SeqCst) {
            return Err(Error::EngineUnavailable {
                engine: self.name(),
                reason: "engine is asleep".into(),
            });
        }

        let delay = *self
            .generate_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.failing_generates) {
            return Err(Error::Generation {
                engine: self.name(),
                reason: "injected generation failure".into(),
            });
        }

        let (version, digest) = {
            let installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
            (installed.version, installed.digest)
        };

        let mut outputs = Vec::with_capacity(requests.len());
        for request in requests {
            // Stale or future-tagged requests are refused, never silently
            // served from different weights.
            if request.weight_version != version {
                return Err(Error::VersionMismatch {
                    requested: request.weight_version,
                    current: version,
                });
            }
            let text = self.continuation(&request, version, digest);
            let tokens = text.split_whitespace().count();
            outputs.push(GenerationOutput {
                trajectory_id: request.trajectory_id,
                text,
                weight_version: version,
                tokens,
            });
        }
        Ok(outputs)
    }

    async fn apply_weights(&self, update: WeightUpdate) -> Result<u64> {
        let delay = *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.failing_applies) {
            return Err(Error::Generation {
                engine: self.name(),
                reason: "injected weight apply failure".into(),
            });
        }

        let snapshot: WeightSnapshot = match update {
            WeightUpdate::Shared(snapshot) => (*snapshot).clone(),
            WeightUpdate::Encoded { bytes, .. } => WeightSnapshot::from_bytes(&bytes)?,
        };

        // Single swap under the lock: no partially-applied snapshot is ever
        // observable from generate.
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        installed.digest = snapshot.digest();
        installed.param_count = snapshot.param_count();
        installed.version = snapshot.version;
        Ok(installed.version)
    }

    async fn healthcheck(&self) -> Result<()> {
        if self.awake.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::EngineUnavailable {
                engine: self.name(),
                reason: "engine is asleep".into(),
            })
        }
    }

    async fn sleep(&self) -> Result<()> {
        self.awake.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wake(&self) -> Result<()> {
        self.awake.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn tp_size(&self) -> usize {
        self.tp_size
    }

    fn address(&self) -> EngineAddress {
        EngineAddress::Local {
            replica: self.replica,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::api::SamplingParams;
    use crate::sync::snapshot::WeightShard;
    use uuid::Uuid;

    fn request(version: u64, prompt: &str) -> GenerationRequest {
        GenerationRequest {
            trajectory_id: Uuid::new_v4(),
            prompt: prompt.into(),
            weight_version: version,
            sampling: SamplingParams::greedy(32),
        }
    }

    fn snapshot(version: u64, data: Vec<f32>) -> WeightSnapshot {
        WeightSnapshot::new(version, vec![WeightShard::new("w", data)])
    }

    #[tokio::test]
    async fn test_generate_requires_acked_version() {
        let engine = LocalEngine::new(0, 1, 7);
        engine
            .apply_weights(WeightUpdate::Shared(Arc::new(snapshot(2, vec![1.0]))))
            .await
            .unwrap();

        let ok = engine.generate(vec![request(2, "look around")]).await;
        assert!(ok.is_ok());

        let stale = engine.generate(vec![request(1, "look around")]).await;
        assert!(matches!(
            stale,
            Err(Error::VersionMismatch {
                requested: 1,
                current: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_outputs_deterministic_per_weights() {
        let engine = LocalEngine::new(0, 1, 7);
        engine
            .apply_weights(WeightUpdate::Shared(Arc::new(snapshot(1, vec![1.0]))))
            .await
            .unwrap();

        let a = engine.generate(vec![request(1, "go north")]).await.unwrap();
        let b = engine.generate(vec![request(1, "go north")]).await.unwrap();
        assert_eq!(a[0].text, b[0].text);

        // New weights change the continuation even for the same prompt.
        engine
            .apply_weights(WeightUpdate::Shared(Arc::new(snapshot(2, vec![2.0]))))
            .await
            .unwrap();
        let c = engine.generate(vec![request(2, "go north")]).await.unwrap();
        assert_ne!(a[0].text, c[0].text);
    }

    #[tokio::test]
    async fn test_sampling_varies_across_trajectories() {
        let engine = LocalEngine::new(0, 1, 7);
        let sampled = SamplingParams {
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 32,
        };

        let make = |params: &SamplingParams| GenerationRequest {
            trajectory_id: Uuid::new_v4(),
            prompt: "same prompt".into(),
            weight_version: 0,
            sampling: params.clone(),
        };

        // Same prompt, different trajectories: sampled outputs differ.
        let a = engine.generate(vec![make(&sampled)]).await.unwrap();
        let b = engine.generate(vec![make(&sampled)]).await.unwrap();
        assert_ne!(a[0].text, b[0].text);

        // Greedy decoding ignores the trajectory identity.
        let greedy = SamplingParams::greedy(32);
        let c = engine.generate(vec![make(&greedy)]).await.unwrap();
        let d = engine.generate(vec![make(&greedy)]).await.unwrap();
        assert_eq!(c[0].text, d[0].text);
    }

    #[tokio::test]
    async fn test_sleep_refuses_generation() {
        let engine = LocalEngine::new(0, 1, 7);
        engine.sleep().await.unwrap();

        let err = engine.generate(vec![request(0, "anything")]).await;
        assert!(matches!(err, Err(Error::EngineUnavailable { .. })));
        assert!(engine.healthcheck().await.is_err());

        engine.wake().await.unwrap();
        assert!(engine.healthcheck().await.is_ok());
        assert!(engine.generate(vec![request(0, "anything")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let engine = LocalEngine::new(0, 1, 7);
        engine.fail_next_generates(2);

        assert!(engine.generate(vec![request(0, "a")]).await.is_err());
        assert!(engine.generate(vec![request(0, "b")]).await.is_err());
        assert!(engine.generate(vec![request(0, "c")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_accepts_encoded_payload() {
        let engine = LocalEngine::new(0, 1, 7);
        let snap = snapshot(4, vec![0.25, 0.75]);
        let bytes = snap.to_bytes().unwrap();

        let acked = engine
            .apply_weights(WeightUpdate::Encoded {
                version: 4,
                bytes: Arc::new(bytes),
            })
            .await
            .unwrap();
        assert_eq!(acked, 4);
        assert!(engine.generate(vec![request(4, "x")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_delay_is_observable() {
        let engine = LocalEngine::new(0, 1, 7);
        engine.set_apply_delay(Some(Duration::from_millis(30)));

        let started = tokio::time::Instant::now();
        engine
            .apply_weights(WeightUpdate::Shared(Arc::new(snapshot(1, vec![1.0]))))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
