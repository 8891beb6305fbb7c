//! Transports that move a weight snapshot from trainer to engines.
//!
//! The expensive part of a broadcast happens once per sync, not once per
//! engine: the collective transport pins the snapshot behind one `Arc`, the
//! serialized transport encodes the CBOR payload a single time and clones
//! the byte handle.

use std::sync::Arc;

use crate::config::SyncTransportKind;
use crate::engine::api::WeightUpdate;
use crate::error::Result;

use super::snapshot::WeightSnapshot;

/// Strategy for delivering snapshots to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTransport {
    /// Share the snapshot in memory. Natural when trainer and engines are
    /// colocated or adjacent in the same process tree.
    Collective,
    /// Encode once, ship bytes. Required for topologically separate
    /// engines such as HTTP replicas.
    Serialized,
}

impl SyncTransport {
    pub fn from_config(kind: SyncTransportKind) -> Self {
        match kind {
            SyncTransportKind::Collective => SyncTransport::Collective,
            SyncTransportKind::Serialized => SyncTransport::Serialized,
        }
    }

    /// Do the per-sync preparation work.
    pub fn prepare(&self, snapshot: WeightSnapshot) -> Result<PreparedUpdate> {
        let version = snapshot.version;
        let update = match self {
            SyncTransport::Collective => WeightUpdate::Shared(Arc::new(snapshot)),
            SyncTransport::Serialized => {
                let bytes = snapshot.to_bytes()?;
                WeightUpdate::Encoded {
                    version,
                    bytes: Arc::new(bytes),
                }
            }
        };
        Ok(PreparedUpdate { update })
    }
}

/// A snapshot prepared for broadcast; cloning per engine is cheap.
#[derive(Debug, Clone)]
pub struct PreparedUpdate {
    update: WeightUpdate,
}

impl PreparedUpdate {
    pub fn update(&self) -> WeightUpdate {
        self.update.clone()
    }

    pub fn version(&self) -> u64 {
        self.update.version()
    }

    /// Bytes that go over the wire, when the transport has a wire at all.
    pub fn wire_bytes(&self) -> Option<usize> {
        match &self.update {
            WeightUpdate::Shared(_) => None,
            WeightUpdate::Encoded { bytes, .. } => Some(bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::snapshot::WeightShard;

    fn snapshot() -> WeightSnapshot {
        WeightSnapshot::new(9, vec![WeightShard::new("w", vec![1.0, 2.0])])
    }

    #[test]
    fn test_collective_shares_in_memory() {
        let prepared = SyncTransport::Collective.prepare(snapshot()).unwrap();
        assert_eq!(prepared.version(), 9);
        assert!(prepared.wire_bytes().is_none());

        match prepared.update() {
            WeightUpdate::Shared(s) => assert_eq!(s.version, 9),
            WeightUpdate::Encoded { .. } => panic!("collective transport must not encode"),
        }
    }

    #[test]
    fn test_serialized_encodes_once_and_round_trips() {
        let prepared = SyncTransport::Serialized.prepare(snapshot()).unwrap();
        assert_eq!(prepared.version(), 9);
        assert!(prepared.wire_bytes().unwrap() > 0);

        let restored = prepared.update().into_snapshot().unwrap();
        assert_eq!(restored, snapshot());
    }

    #[test]
    fn test_from_config() {
        assert_eq!(
            SyncTransport::from_config(SyncTransportKind::Collective),
            SyncTransport::Collective
        );
        assert_eq!(
            SyncTransport::from_config(SyncTransportKind::Serialized),
            SyncTransport::Serialized
        );
    }
}
