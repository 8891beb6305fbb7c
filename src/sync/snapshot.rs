//! Weight snapshots: the unit of trainer-to-engine transfer.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One named shard of flattened policy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightShard {
    /// Shard name, e.g. `policy.shard2`.
    pub name: String,
    /// Flattened parameter values.
    pub data: Vec<f32>,
}

impl WeightShard {
    pub fn new(name: impl Into<String>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// A complete, versioned copy of the policy weights.
///
/// The version is the optimizer step that produced the weights. Engines
/// install a snapshot atomically: all shards and the version move together,
/// or nothing changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub version: u64,
    pub shards: Vec<WeightShard>,
}

impl WeightSnapshot {
    pub fn new(version: u64, shards: Vec<WeightShard>) -> Self {
        Self { version, shards }
    }

    /// Total parameter count across all shards.
    pub fn param_count(&self) -> usize {
        self.shards.iter().map(|s| s.data.len()).sum()
    }

    /// FNV-1a content digest over version, shard names and parameter bits.
    ///
    /// Used to verify serialized transfers and checkpoint integrity without
    /// comparing full payloads.
    pub fn digest(&self) -> u64 {
        let mut hash = Fnv1a::new();
        hash.write(&self.version.to_le_bytes());
        for shard in &self.shards {
            hash.write(shard.name.as_bytes());
            for value in &shard.data {
                hash.write(&value.to_bits().to_le_bytes());
            }
        }
        hash.finish()
    }

    /// CBOR-encode for the serialized sync transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode a snapshot produced by [`WeightSnapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot = ciborium::from_reader(bytes)?;
        Ok(snapshot)
    }
}

/// Minimal incremental FNV-1a (64-bit), shared by the digest and the
/// deterministic local engine.
pub(crate) struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub(crate) fn new() -> Self {
        Self(Self::OFFSET)
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    pub(crate) fn finish(&self) -> u64 {
        self.0
    }
}
