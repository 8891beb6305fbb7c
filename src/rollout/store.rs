//! On-disk trajectory dumps, one JSON file per training step.
//!
//! Dumps are an inspection surface, not a training dependency: the run loop
//! works entirely in memory and only writes here when a dump directory is
//! configured. Files are self-describing and human-readable so a step can be
//! examined long after the run.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::trajectory::{TrainingBatch, TrajectoryGroup};

/// The serialized form of one dumped step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDump {
    pub step: u64,
    pub created_at: DateTime<Utc>,
    /// Trajectories across all groups.
    pub trajectories: usize,
    /// Turns across all trajectories.
    pub turns: usize,
    pub mean_reward: f64,
    pub success_rate: f64,
    pub groups: Vec<TrajectoryGroup>,
}

/// Writes and reads per-step trajectory dumps under one root directory.
pub struct TrajectoryStore {
    root: PathBuf,
}

impl TrajectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dump_path(&self, step: u64) -> PathBuf {
        self.root.join(format!("step_{step:06}.json"))
    }

    /// Serialize the batch for `step` to its dump file.
    pub fn dump_batch(&self, step: u64, batch: &TrainingBatch) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let dump = BatchDump {
            step,
            created_at: Utc::now(),
            trajectories: batch.trajectory_count(),
            turns: batch.total_turns(),
            mean_reward: batch.mean_reward(),
            success_rate: batch.success_rate(),
            groups: batch.groups.clone(),
        };
        let path = self.dump_path(step);
        let json = serde_json::to_string_pretty(&dump)?;
        fs::write(&path, json)?;
        tracing::info!(
            path = %path.display(),
            step,
            trajectories = dump.trajectories,
            "Dumped trajectory batch"
        );
        Ok(path)
    }

    /// Read back the dump for one step.
    pub fn read_dump(&self, step: u64) -> Result<BatchDump> {
        let path = self.dump_path(step);
        let data = fs::read_to_string(&path).map_err(|e| {
            Error::Checkpoint(format!("no trajectory dump at {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Steps that have a dump on disk, ascending.
    pub fn list_steps(&self) -> Result<Vec<u64>> {
        let mut steps = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(steps),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(step) = name
                .strip_prefix("step_")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    /// The most recent dumped step, if any.
    pub fn latest_step(&self) -> Result<Option<u64>> {
        Ok(self.list_steps()?.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::trajectory::{TerminationReason, Trajectory, Turn};
    use uuid::Uuid;

    fn sample_batch() -> TrainingBatch {
        let mut group = TrajectoryGroup::new("task0", "solve it");
        for (sample_index, reward) in [(0usize, 1.0f64), (1, 0.0)] {
            group.trajectories.push(Trajectory {
                id: Uuid::new_v4(),
                task_id: "task0".into(),
                sample_index,
                turns: vec![Turn {
                    prompt: "solve it".into(),
                    completion: "done".into(),
                    observation: Some("ok".into()),
                    reward,
                    turn_index: 0,
                    weight_version: 3,
                    tokens: 4,
                }],
                total_reward: reward,
                termination: if reward > 0.0 {
                    TerminationReason::GoalReached
                } else {
                    TerminationReason::MaxTurns
                },
            });
        }
        TrainingBatch::from_groups(vec![group], 2).unwrap()
    }

    #[test]
    fn test_dump_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path().join("dumps"));

        let batch = sample_batch();
        store.dump_batch(7, &batch).unwrap();

        let dump = store.read_dump(7).unwrap();
        assert_eq!(dump.step, 7);
        assert_eq!(dump.trajectories, 2);
        assert_eq!(dump.turns, 2);
        assert!((dump.success_rate - 0.5).abs() < 1e-12);
        assert_eq!(dump.groups[0].trajectories[0].turns[0].weight_version, 3);
    }

    #[test]
    fn test_list_steps_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path());

        let batch = sample_batch();
        for step in [12u64, 3, 7] {
            store.dump_batch(step, &batch).unwrap();
        }
        assert_eq!(store.list_steps().unwrap(), vec![3, 7, 12]);
        assert_eq!(store.latest_step().unwrap(), Some(12));
    }

    #[test]
    fn test_missing_root_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path().join("never_created"));
        assert_eq!(store.list_steps().unwrap(), Vec::<u64>::new());
        assert_eq!(store.latest_step().unwrap(), None);
    }

    #[test]
    fn test_read_missing_dump_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path());
        assert!(store.read_dump(99).is_err());
    }
}
