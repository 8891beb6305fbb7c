//! The policy trainer: step accounting over a training backend.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::rollout::trajectory::TrainingBatch;
use crate::sync::snapshot::WeightSnapshot;

use super::backend::{BackendState, TrainingBackend};

/// Everything a checkpoint needs to resume the trainer exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Completed optimizer steps; also the current weight version.
    pub step: u64,
    /// Run-level seed, restored so derived streams stay consistent.
    pub seed: u64,
    pub backend: BackendState,
}

/// The result of one consumed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub step: u64,
    /// Version of the weights produced by this step.
    pub weight_version: u64,
    pub loss: f64,
    pub grad_norm: f64,
    pub mean_advantage: f64,
    pub mean_reward: f64,
    pub success_rate: f64,
    pub trajectories: usize,
    pub degenerate_groups: usize,
}

/// Owns the optimizer-step counter and turns finished batches into new
/// weight versions.
///
/// The weight version is the step count: version N is the weights after N
/// optimizer steps, and version 0 is the freshly initialized policy.
pub struct PolicyTrainer<B: TrainingBackend> {
    backend: B,
    step: u64,
    seed: u64,
}

impl<B: TrainingBackend> PolicyTrainer<B> {
    pub fn new(backend: B, seed: u64) -> Self {
        Self {
            backend,
            step: 0,
            seed,
        }
    }

    /// Completed optimizer steps.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The version engines must serve to be considered current.
    pub fn weight_version(&self) -> u64 {
        self.step
    }

    /// Snapshot of the current weights at the current version.
    pub fn current_weights(&self) -> WeightSnapshot {
        self.backend.export_weights(self.step)
    }

    /// Consume one finished batch: advantages, backward pass, optimizer
    /// step, version bump.
    pub async fn consume(&mut self, batch: &TrainingBatch) -> Result<TrainReport> {
        if batch.group_count() == 0 {
            return Err(Error::Invariant("cannot train on an empty batch".into()));
        }

        let advantages: Vec<Vec<f64>> = batch.groups.iter().map(|g| g.advantages()).collect();
        let metrics = self.backend.forward_backward(batch, &advantages).await?;

        let next_version = self.step + 1;
        self.backend.optimizer_step(next_version).await?;
        self.step = next_version;

        let report = TrainReport {
            step: self.step,
            weight_version: next_version,
            loss: metrics.loss,
            grad_norm: metrics.grad_norm,
            mean_advantage: metrics.mean_advantage,
            mean_reward: batch.mean_reward(),
            success_rate: batch.success_rate(),
            trajectories: batch.trajectory_count(),
            degenerate_groups: metrics.degenerate_groups,
        };
        info!(
            step = report.step,
            loss = report.loss,
            grad_norm = report.grad_norm,
            mean_reward = report.mean_reward,
            success_rate = format!("{:.2}", report.success_rate),
            degenerate = report.degenerate_groups,
            "Training step applied"
        );
        Ok(report)
    }

    /// Capture the full trainer state for checkpointing.
    pub fn state(&self) -> TrainerState {
        TrainerState {
            step: self.step,
            seed: self.seed,
            backend: self.backend.export_state(),
        }
    }

    /// Restore from a checkpointed state, replacing step counter and
    /// backend state wholesale.
    pub fn restore(&mut self, state: TrainerState) -> Result<()> {
        self.backend.restore_state(state.backend)?;
        self.step = state.step;
        self.seed = state.seed;
        info!(step = self.step, "Trainer state restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::trajectory::{TerminationReason, Trajectory, TrajectoryGroup, Turn};
    use crate::trainer::backend::InMemoryBackend;
    use uuid::Uuid;

    fn batch(rewards: &[f64]) -> TrainingBatch {
        let mut group = TrajectoryGroup::new("t0", "prompt");
        for (i, &reward) in rewards.iter().enumerate() {
            group.trajectories.push(Trajectory {
                id: Uuid::new_v4(),
                task_id: "t0".into(),
                sample_index: i,
                turns: vec![Turn {
                    prompt: "prompt".into(),
                    completion: format!("completion {i}"),
                    observation: Some("ok".into()),
                    reward,
                    turn_index: 0,
                    weight_version: 0,
                    tokens: 2,
                }],
                total_reward: reward,
                termination: if reward > 0.0 {
                    TerminationReason::GoalReached
                } else {
                    TerminationReason::TaskFailed
                },
            });
        }
        TrainingBatch::from_groups(vec![group], rewards.len()).unwrap()
    }

    fn trainer() -> PolicyTrainer<InMemoryBackend> {
        PolicyTrainer::new(InMemoryBackend::new(128, 1e-3, 42), 42)
    }

    #[tokio::test]
    async fn test_consume_bumps_step_and_version() {
        let mut trainer = trainer();
        assert_eq!(trainer.weight_version(), 0);
        assert_eq!(trainer.current_weights().version, 0);

        let report = trainer.consume(&batch(&[1.0, 0.0])).await.unwrap();
        assert_eq!(report.step, 1);
        assert_eq!(report.weight_version, 1);
        assert_eq!(trainer.current_weights().version, 1);

        trainer.consume(&batch(&[0.0, 1.0])).await.unwrap();
        assert_eq!(trainer.weight_version(), 2);
    }

    #[tokio::test]
    async fn test_report_reflects_batch_statistics() {
        let mut trainer = trainer();
        let report = trainer.consume(&batch(&[1.0, 1.0, 0.0, 0.0])).await.unwrap();
        assert!((report.mean_reward - 0.5).abs() < 1e-12);
        assert!((report.success_rate - 0.5).abs() < 1e-12);
        assert_eq!(report.trajectories, 4);
        assert!(report.mean_advantage.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let mut trainer = trainer();
        let empty = TrainingBatch::from_groups(Vec::new(), 1).unwrap();
        assert!(matches!(
            trainer.consume(&empty).await,
            Err(Error::Invariant(_))
        ));
        assert_eq!(trainer.step(), 0);
    }

    #[tokio::test]
    async fn test_state_restore_resumes_exactly() {
        let mut original = trainer();
        original.consume(&batch(&[1.0, 0.0])).await.unwrap();
        original.consume(&batch(&[0.0, 1.0])).await.unwrap();
        let state = original.state();

        let mut resumed = trainer();
        resumed.restore(state).unwrap();
        assert_eq!(resumed.step(), 2);
        assert_eq!(
            resumed.current_weights().digest(),
            original.current_weights().digest()
        );

        // Both continue identically from the restored point.
        let next = batch(&[1.0, 0.0]);
        original.consume(&next).await.unwrap();
        resumed.consume(&next).await.unwrap();
        assert_eq!(
            resumed.current_weights().digest(),
            original.current_weights().digest()
        );
    }
}
