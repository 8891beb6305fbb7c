//! Remote engine replica reachable over HTTP.
//!
//! Thin client for a serving process that exposes `/generate`, `/weights`,
//! `/health` and the `/sleep`/`/wake` pair. Weight payloads travel as CBOR
//! (the serialized sync transport); everything else is JSON.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::api::{
    EngineAddress, GenerationOutput, GenerationRequest, InferenceEngine, WeightUpdate,
};

#[derive(Debug, Serialize, Deserialize)]
struct GenerateBody {
    requests: Vec<GenerationRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenerateResponse {
    outputs: Vec<GenerationOutput>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WeightsAck {
    version: u64,
}

/// HTTP client for one remote engine replica.
pub struct HttpEngine {
    client: Client,
    base_url: String,
    tp_size: usize,
}

impl HttpEngine {
    pub fn new(base_url: &str, tp_size: usize, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build reqwest client for engine");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tp_size,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unavailable(&self, reason: impl ToString) -> Error {
        Error::EngineUnavailable {
            engine: self.base_url.clone(),
            reason: reason.to_string(),
        }
    }

    /// POST to a bare endpoint and require a 2xx, used by the sleep/wake
    /// and health paths.
    async fn post_empty(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("{path} returned {status}: {text}")));
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceEngine for HttpEngine {
    async fn generate(&self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationOutput>> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&GenerateBody { requests })
            .send()
            .await
            .map_err(|e| Error::Generation {
                engine: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Generation {
                engine: self.base_url.clone(),
                reason: format!("engine returned {status}: {text}"),
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| Error::Generation {
            engine: self.base_url.clone(),
            reason: format!("invalid generate response: {e}"),
        })?;
        Ok(parsed.outputs)
    }

    async fn apply_weights(&self, update: WeightUpdate) -> Result<u64> {
        // Remote engines always take the encoded form; a shared snapshot is
        // encoded here at the pool boundary.
        let bytes: Vec<u8> = match update {
            WeightUpdate::Encoded { bytes, .. } => bytes.as_ref().clone(),
            WeightUpdate::Shared(snapshot) => snapshot.to_bytes()?,
        };

        let response = self
            .client
            .post(format!("{}/weights", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/cbor")
            .body(bytes)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("/weights returned {status}: {text}")));
        }

        let ack: WeightsAck = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("invalid weights ack: {e}")))?;
        Ok(ack.version)
    }

    async fn healthcheck(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("/health returned {}", response.status())));
        }
        Ok(())
    }

    async fn sleep(&self) -> Result<()> {
        self.post_empty("/sleep").await
    }

    async fn wake(&self) -> Result<()> {
        self.post_empty("/wake").await
    }

    fn tp_size(&self) -> usize {
        self.tp_size
    }

    fn address(&self) -> EngineAddress {
        EngineAddress::Remote {
            url: self.base_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::api::SamplingParams;
    use uuid::Uuid;

    #[test]
    fn test_new_normalizes_base_url() {
        let engine = HttpEngine::new("http://10.0.0.5:8000/", 2, 30);
        assert_eq!(engine.base_url(), "http://10.0.0.5:8000");
        assert_eq!(engine.tp_size(), 2);
        assert_eq!(
            engine.address(),
            EngineAddress::Remote {
                url: "http://10.0.0.5:8000".into()
            }
        );
    }

    #[test]
    fn test_generate_body_serde_round_trip() {
        let body = GenerateBody {
            requests: vec![GenerationRequest {
                trajectory_id: Uuid::new_v4(),
                prompt: "open the drawer".into(),
                weight_version: 5,
                sampling: SamplingParams::greedy(16),
            }],
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: GenerateBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.requests.len(), 1);
        assert_eq!(back.requests[0].weight_version, 5);
    }

    #[test]
    fn test_weights_ack_parses() {
        let ack: WeightsAck = serde_json::from_str(r#"{"version": 12}"#).unwrap();
        assert_eq!(ack.version, 12);
    }
}
