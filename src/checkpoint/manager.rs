//! Durable trainer checkpoints, one directory per optimizer step.
//!
//! Layout under the checkpoint root:
//!
//! ```text
//! checkpoints/
//!   step_000010/record.ckpt
//!   step_000020/record.ckpt
//! ```
//!
//! Records are CBOR-encoded and carry a content digest over the serialized
//! trainer state. Loading verifies the digest; resume takes the newest
//! record that verifies, skipping corrupt ones with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CheckpointConfig;
use crate::error::{Error, Result};
use crate::sync::snapshot::Fnv1a;
use crate::trainer::TrainerState;

const RECORD_FILE: &str = "record.ckpt";

/// Identifying information for one saved checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: u64,
    pub created_at: DateTime<Utc>,
    /// Serialized trainer state size in bytes.
    pub size_bytes: usize,
    /// FNV-1a digest of the serialized trainer state.
    pub digest: u64,
}

/// A verified checkpoint read back from disk.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub meta: CheckpointMetadata,
    pub state: TrainerState,
}

/// On-disk wire form: metadata plus the state payload it digests.
#[derive(Serialize, Deserialize)]
struct RecordEnvelope {
    meta: CheckpointMetadata,
    state: Vec<u8>,
}

fn digest_of(bytes: &[u8]) -> u64 {
    let mut hash = Fnv1a::new();
    hash.write(bytes);
    hash.finish()
}

/// Saves, lists and restores trainer checkpoints under one root directory.
pub struct CheckpointManager {
    root: PathBuf,
    interval: u64,
    keep_last: Option<usize>,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, interval: u64, keep_last: Option<usize>) -> Self {
        Self {
            root: root.into(),
            interval,
            keep_last,
        }
    }

    pub fn from_config(cfg: &CheckpointConfig) -> Self {
        Self::new(&cfg.dir, cfg.interval, cfg.keep_last)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `step` is on the checkpoint cadence (never for interval 0).
    pub fn due(&self, step: u64) -> bool {
        self.interval > 0 && step > 0 && step % self.interval == 0
    }

    fn step_dir(&self, step: u64) -> PathBuf {
        self.root.join(format!("step_{step:06}"))
    }

    /// Persist the trainer state as the record for its step.
    ///
    /// Failures here are fatal to the run: continuing to train past a
    /// checkpoint that silently failed would lose the work on the next
    /// restart.
    pub fn save(&self, state: &TrainerState) -> Result<CheckpointMetadata> {
        let mut payload = Vec::new();
        ciborium::into_writer(state, &mut payload)?;
        let meta = CheckpointMetadata {
            step: state.step,
            created_at: Utc::now(),
            size_bytes: payload.len(),
            digest: digest_of(&payload),
        };
        let envelope = RecordEnvelope {
            meta: meta.clone(),
            state: payload,
        };

        let dir = self.step_dir(state.step);
        fs::create_dir_all(&dir)?;
        let path = dir.join(RECORD_FILE);
        // Write-then-rename keeps a torn write from shadowing an existing
        // record at the same step.
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        let mut buf = Vec::new();
        ciborium::into_writer(&envelope, &mut buf)?;
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &path)?;

        info!(
            path = %path.display(),
            step = meta.step,
            digest = format!("{:016x}", meta.digest),
            "Checkpoint saved"
        );
        self.apply_retention()?;
        Ok(meta)
    }

    /// Load and verify the record for one step.
    pub fn load_step(&self, step: u64) -> Result<CheckpointRecord> {
        let path = self.step_dir(step).join(RECORD_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            Error::Checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        let envelope: RecordEnvelope = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| Error::Checkpoint(format!("cannot decode {}: {e}", path.display())))?;

        if envelope.meta.step != step {
            return Err(Error::Checkpoint(format!(
                "record at {} claims step {}, directory says {step}",
                path.display(),
                envelope.meta.step
            )));
        }
        let digest = digest_of(&envelope.state);
        if digest != envelope.meta.digest {
            return Err(Error::Checkpoint(format!(
                "digest mismatch at {}: recorded {:016x}, computed {digest:016x}",
                path.display(),
                envelope.meta.digest
            )));
        }

        let state: TrainerState = ciborium::from_reader(envelope.state.as_slice())
            .map_err(|e| Error::Checkpoint(format!("cannot decode state at step {step}: {e}")))?;
        Ok(CheckpointRecord {
            meta: envelope.meta,
            state,
        })
    }

    /// The newest record that verifies, or `None` for a cold start.
    ///
    /// Corrupt records are skipped with a warning so a bad final write does
    /// not block resuming from the step before it.
    pub fn load_latest(&self) -> Result<Option<CheckpointRecord>> {
        let mut steps = self.list_steps()?;
        steps.reverse();
        for step in steps {
            match self.load_step(step) {
                Ok(record) => {
                    info!(
                        step = record.meta.step,
                        created_at = %record.meta.created_at,
                        "Resuming from checkpoint"
                    );
                    return Ok(Some(record));
                }
                Err(e) => {
                    warn!(step, error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        Ok(None)
    }

    /// Steps with a record directory on disk, ascending.
    pub fn list_steps(&self) -> Result<Vec<u64>> {
        let mut steps = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(steps),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(step) = name
                .strip_prefix("step_")
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    /// Drop the oldest records beyond `keep_last`. Retention trouble is
    /// logged, not fatal: the new record is already safe.
    fn apply_retention(&self) -> Result<()> {
        let Some(keep) = self.keep_last else {
            return Ok(());
        };
        let steps = self.list_steps()?;
        if steps.len() <= keep {
            return Ok(());
        }
        for &step in &steps[..steps.len() - keep] {
            let dir = self.step_dir(step);
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!(step, "Retired old checkpoint"),
                Err(e) => warn!(step, error = %e, "Failed to retire old checkpoint"),
            }
        }
        Ok(())
    }
}
