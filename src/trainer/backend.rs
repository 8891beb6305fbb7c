//! Training backend seam.
//!
//! The trainer delegates the heavy half of a step, the forward/backward pass
//! and the optimizer update, to a [`TrainingBackend`]. A production backend
//! fronts an external tensor framework; this crate ships
//! [`InMemoryBackend`], a deterministic stand-in with real optimizer state
//! so weight sync and checkpointing are exercised end to end.
//!
//! The in-memory update is a policy-gradient shape over pseudo log-probs:
//!
//!   loss   = -1/N * sum_i A_i * logp_i
//!   grad_j = sum_i A_i * noise_ij      (sparse, per-trajectory noise)
//!
//! where A_i is the group-relative advantage and logp_i / noise_ij are drawn
//! from an RNG seeded by the trajectory content, so identical inputs and
//! seed reproduce identical weights.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::rollout::trajectory::{TrainingBatch, Trajectory};
use crate::sync::snapshot::{Fnv1a, WeightShard, WeightSnapshot};

/// Parameters per shard when exporting snapshots.
const SHARD_SIZE: usize = 1024;
/// Gradient positions touched per trajectory.
const GRAD_TOUCHES: usize = 32;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Seam types
// ---------------------------------------------------------------------------

/// Metrics out of one forward/backward pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackwardMetrics {
    /// Mean advantage-weighted surrogate loss.
    pub loss: f64,
    /// Mean group-relative advantage across the batch (should hover near 0).
    pub mean_advantage: f64,
    /// L2 norm of the accumulated gradient.
    pub grad_norm: f64,
    /// Groups whose rewards were all equal; they contribute no gradient.
    pub degenerate_groups: usize,
}

/// Serializable backend state, captured into checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub weights: Vec<f32>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub seed: u64,
    /// Optimizer steps applied so far (bias-correction time step).
    pub updates_applied: u64,
}

/// The training-framework collaborator.
///
/// `forward_backward` accumulates gradients for an advantage-weighted batch;
/// `optimizer_step` folds them into the weights and exports the result at
/// the given version. State export/restore feeds the checkpoint manager.
#[allow(async_fn_in_trait)]
pub trait TrainingBackend: Send {
    async fn forward_backward(
        &mut self,
        batch: &TrainingBatch,
        advantages: &[Vec<f64>],
    ) -> Result<BackwardMetrics>;

    async fn optimizer_step(&mut self, version: u64) -> Result<WeightSnapshot>;

    /// Snapshot the current weights without stepping.
    fn export_weights(&self, version: u64) -> WeightSnapshot;

    fn export_state(&self) -> BackendState;

    fn restore_state(&mut self, state: BackendState) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Deterministic, seedable training backend with Adam-style moments.
pub struct InMemoryBackend {
    weights: Vec<f32>,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    pending_grad: Option<Vec<f32>>,
    learning_rate: f64,
    seed: u64,
    updates_applied: u64,
}

impl InMemoryBackend {
    pub fn new(param_count: usize, learning_rate: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = (0..param_count)
            .map(|_| rng.gen_range(-0.1..0.1))
            .collect();
        Self {
            weights,
            first_moment: vec![0.0; param_count],
            second_moment: vec![0.0; param_count],
            pending_grad: None,
            learning_rate,
            seed,
            updates_applied: 0,
        }
    }

    pub fn from_config(cfg: &TrainerConfig) -> Self {
        Self::new(cfg.param_count, cfg.learning_rate, cfg.seed)
    }

    pub fn param_count(&self) -> usize {
        self.weights.len()
    }

    /// RNG stream for one trajectory, derived from its content and the seed.
    fn trajectory_rng(&self, trajectory: &Trajectory) -> StdRng {
        let mut hash = Fnv1a::new();
        hash.write(trajectory.task_id.as_bytes());
        for turn in &trajectory.turns {
            hash.write(turn.completion.as_bytes());
        }
        StdRng::seed_from_u64(self.seed ^ hash.finish())
    }
}

impl TrainingBackend for InMemoryBackend {
    async fn forward_backward(
        &mut self,
        batch: &TrainingBatch,
        advantages: &[Vec<f64>],
    ) -> Result<BackwardMetrics> {
        if batch.group_count() == 0 {
            return Err(Error::Invariant(
                "forward/backward on an empty batch".into(),
            ));
        }
        if advantages.len() != batch.group_count() {
            return Err(Error::Invariant(format!(
                "advantage groups ({}) do not match batch groups ({})",
                advantages.len(),
                batch.group_count()
            )));
        }

        let param_count = self.weights.len();
        let mut grad = vec![0.0f32; param_count];
        let mut total_loss = 0.0;
        let mut total_advantage = 0.0;
        let mut samples = 0usize;
        let mut degenerate_groups = 0usize;

        for (group, group_advantages) in batch.groups.iter().zip(advantages) {
            // All-equal rewards normalize to zero advantage everywhere;
            // the group cannot move the policy.
            if group_advantages.iter().all(|a| a.abs() < 1e-12) {
                degenerate_groups += 1;
                tracing::debug!(task_id = %group.task_id, "Degenerate group, no gradient signal");
            }
            for (trajectory, &advantage) in group.trajectories.iter().zip(group_advantages) {
                let mut rng = self.trajectory_rng(trajectory);
                // Pseudo log-prob in [-3, -1), stable per trajectory.
                let log_prob = -3.0 + 2.0 * rng.gen::<f64>();
                total_loss += -(advantage * log_prob);
                total_advantage += advantage;
                samples += 1;

                if advantage.abs() < 1e-12 {
                    continue;
                }
                for _ in 0..GRAD_TOUCHES.min(param_count) {
                    let j = rng.gen_range(0..param_count);
                    grad[j] += (advantage * rng.gen_range(-1.0..1.0)) as f32;
                }
            }
        }

        let grad_norm = grad.iter().map(|g| (*g as f64).powi(2)).sum::<f64>().sqrt();
        let metrics = BackwardMetrics {
            loss: total_loss / samples as f64,
            mean_advantage: total_advantage / samples as f64,
            grad_norm,
            degenerate_groups,
        };
        tracing::debug!(
            loss = metrics.loss,
            grad_norm = metrics.grad_norm,
            degenerate = degenerate_groups,
            "Backward pass accumulated"
        );
        self.pending_grad = Some(grad);
        Ok(metrics)
    }

    async fn optimizer_step(&mut self, version: u64) -> Result<WeightSnapshot> {
        let grad = self.pending_grad.take().ok_or_else(|| {
            Error::Invariant("optimizer step without a preceding forward/backward".into())
        })?;

        self.updates_applied += 1;
        let t = self.updates_applied as i32;
        let bias1 = 1.0 - ADAM_BETA1.powi(t);
        let bias2 = 1.0 - ADAM_BETA2.powi(t);

        for j in 0..self.weights.len() {
            let g = grad[j] as f64;
            let m = ADAM_BETA1 * self.first_moment[j] as f64 + (1.0 - ADAM_BETA1) * g;
            let v = ADAM_BETA2 * self.second_moment[j] as f64 + (1.0 - ADAM_BETA2) * g * g;
            self.first_moment[j] = m as f32;
            self.second_moment[j] = v as f32;
            let update = self.learning_rate * (m / bias1) / ((v / bias2).sqrt() + ADAM_EPS);
            self.weights[j] -= update as f32;
        }

        Ok(self.export_weights(version))
    }

    fn export_weights(&self, version: u64) -> WeightSnapshot {
        let shards = self
            .weights
            .chunks(SHARD_SIZE)
            .enumerate()
            .map(|(i, chunk)| WeightShard::new(format!("policy.shard{i}"), chunk.to_vec()))
            .collect();
        WeightSnapshot::new(version, shards)
    }

    fn export_state(&self) -> BackendState {
        BackendState {
            weights: self.weights.clone(),
            first_moment: self.first_moment.clone(),
            second_moment: self.second_moment.clone(),
            seed: self.seed,
            updates_applied: self.updates_applied,
        }
    }

    fn restore_state(&mut self, state: BackendState) -> Result<()> {
        if state.weights.len() != self.weights.len() {
            return Err(Error::Checkpoint(format!(
                "restored state has {} parameters, backend expects {}",
                state.weights.len(),
                self.weights.len()
            )));
        }
        self.weights = state.weights;
        self.first_moment = state.first_moment;
        self.second_moment = state.second_moment;
        self.seed = state.seed;
        self.updates_applied = state.updates_applied;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::trajectory::{TerminationReason, TrajectoryGroup, Turn};
    use uuid::Uuid;

    fn trajectory(task: &str, sample_index: usize, reward: f64, completion: &str) -> Trajectory {
        Trajectory {
            id: Uuid::new_v4(),
            task_id: task.into(),
            sample_index,
            turns: vec![Turn {
                prompt: format!("{task} prompt"),
                completion: completion.into(),
                observation: Some("ok".into()),
                reward,
                turn_index: 0,
                weight_version: 0,
                tokens: 3,
            }],
            total_reward: reward,
            termination: if reward > 0.0 {
                TerminationReason::GoalReached
            } else {
                TerminationReason::MaxTurns
            },
        }
    }

    fn varied_batch() -> TrainingBatch {
        let mut group = TrajectoryGroup::new("t0", "t0 prompt");
        group.trajectories.push(trajectory("t0", 0, 1.0, "good answer"));
        group.trajectories.push(trajectory("t0", 1, 0.0, "bad answer"));
        TrainingBatch::from_groups(vec![group], 2).unwrap()
    }

    fn flat_batch() -> TrainingBatch {
        let mut group = TrajectoryGroup::new("t0", "t0 prompt");
        group.trajectories.push(trajectory("t0", 0, 1.0, "answer a"));
        group.trajectories.push(trajectory("t0", 1, 1.0, "answer b"));
        TrainingBatch::from_groups(vec![group], 2).unwrap()
    }

    fn advantages_of(batch: &TrainingBatch) -> Vec<Vec<f64>> {
        batch.groups.iter().map(|g| g.advantages()).collect()
    }

    #[tokio::test]
    async fn test_step_is_deterministic_for_same_seed() {
        let batch = varied_batch();
        let advantages = advantages_of(&batch);

        let mut a = InMemoryBackend::new(256, 1e-3, 42);
        let mut b = InMemoryBackend::new(256, 1e-3, 42);
        a.forward_backward(&batch, &advantages).await.unwrap();
        b.forward_backward(&batch, &advantages).await.unwrap();
        let wa = a.optimizer_step(1).await.unwrap();
        let wb = b.optimizer_step(1).await.unwrap();
        assert_eq!(wa.digest(), wb.digest());

        let mut c = InMemoryBackend::new(256, 1e-3, 43);
        c.forward_backward(&batch, &advantages).await.unwrap();
        let wc = c.optimizer_step(1).await.unwrap();
        assert_ne!(wa.digest(), wc.digest());
    }

    #[tokio::test]
    async fn test_varied_rewards_move_the_weights() {
        let batch = varied_batch();
        let advantages = advantages_of(&batch);

        let mut backend = InMemoryBackend::new(128, 1e-3, 7);
        let before = backend.export_weights(0);
        let metrics = backend.forward_backward(&batch, &advantages).await.unwrap();
        assert!(metrics.grad_norm > 0.0);
        // Group z-scores sum to zero.
        assert!(metrics.mean_advantage.abs() < 1e-9);

        let after = backend.optimizer_step(1).await.unwrap();
        assert_eq!(after.version, 1);
        assert_ne!(before.shards, after.shards);
    }

    #[tokio::test]
    async fn test_degenerate_group_leaves_weights_unchanged() {
        let batch = flat_batch();
        let advantages = advantages_of(&batch);

        let mut backend = InMemoryBackend::new(128, 1e-3, 7);
        let before = backend.export_weights(0);
        let metrics = backend.forward_backward(&batch, &advantages).await.unwrap();
        assert_eq!(metrics.degenerate_groups, 1);
        assert_eq!(metrics.grad_norm, 0.0);

        // Zero gradient with zero moments: Adam moves nothing.
        let after = backend.optimizer_step(1).await.unwrap();
        assert_eq!(before.shards, after.shards);
    }

    #[tokio::test]
    async fn test_optimizer_step_requires_backward_pass() {
        let mut backend = InMemoryBackend::new(16, 1e-3, 1);
        let err = backend.optimizer_step(1).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));

        // A gradient is consumed by exactly one step.
        let batch = varied_batch();
        let advantages = advantages_of(&batch);
        backend.forward_backward(&batch, &advantages).await.unwrap();
        backend.optimizer_step(1).await.unwrap();
        assert!(backend.optimizer_step(2).await.is_err());
    }

    #[tokio::test]
    async fn test_state_round_trip_is_exact() {
        let batch = varied_batch();
        let advantages = advantages_of(&batch);

        let mut backend = InMemoryBackend::new(200, 1e-3, 11);
        backend.forward_backward(&batch, &advantages).await.unwrap();
        backend.optimizer_step(1).await.unwrap();

        let state = backend.export_state();
        let mut restored = InMemoryBackend::new(200, 1e-3, 0);
        restored.restore_state(state.clone()).unwrap();
        assert_eq!(restored.export_state(), state);
        assert_eq!(
            restored.export_weights(1).digest(),
            backend.export_weights(1).digest()
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_shape_mismatch() {
        let backend = InMemoryBackend::new(64, 1e-3, 1);
        let state = backend.export_state();
        let mut other = InMemoryBackend::new(65, 1e-3, 1);
        assert!(matches!(
            other.restore_state(state),
            Err(Error::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_sharded_export_layout() {
        let backend = InMemoryBackend::new(2500, 1e-3, 3);
        let snapshot = backend.export_weights(4);
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.param_count(), 2500);
        assert_eq!(snapshot.shards.len(), 3);
        assert_eq!(snapshot.shards[0].name, "policy.shard0");
        assert_eq!(snapshot.shards[2].data.len(), 2500 - 2 * 1024);
    }
}
