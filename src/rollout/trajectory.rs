//! Core rollout data types: turns, trajectories, groups and batches.
//!
//! A [`Trajectory`] is immutable once finalized; the orchestrator is the
//! only writer while it is in flight. The trainer consumes whole
//! [`TrainingBatch`]es, whose groups carry exactly `n_samples_per_prompt`
//! trajectories each, never split across batches.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Single turn
// ---------------------------------------------------------------------------

/// A single turn within a trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Prompt context the engine saw for this turn.
    pub prompt: String,
    /// The generated continuation.
    pub completion: String,
    /// Environment feedback folded in after the turn. `None` when the
    /// trajectory terminated before feedback (generation errors).
    pub observation: Option<String>,
    /// Scalar reward the environment granted for this turn.
    pub reward: f64,
    /// Zero-based index of this turn within the trajectory.
    pub turn_index: usize,
    /// Weight version that produced the completion.
    pub weight_version: u64,
    /// Tokens generated this turn, as counted by the engine.
    pub tokens: usize,
}

// ---------------------------------------------------------------------------
// Termination and lifecycle
// ---------------------------------------------------------------------------

/// Why a trajectory stopped. Every finalized trajectory carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The environment reported the goal reached.
    GoalReached,
    /// The environment reported a terminal failure, e.g. a tool call that
    /// cannot be recovered from.
    TaskFailed,
    /// The per-trajectory turn cap was hit.
    MaxTurns,
    /// The shared step budget ran out before this trajectory finished.
    /// Turns generated so far are kept.
    StepLimit,
    /// The engine call errored or timed out.
    GenerationError,
}

/// Lifecycle of one trajectory inside the orchestrator:
/// `Pending -> AwaitingEngine -> (TurnComplete -> AwaitingEngine)* -> Terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajectoryState {
    /// Created, nothing dispatched yet.
    Pending,
    /// A generation request is in flight.
    AwaitingEngine,
    /// The last turn completed; eligible for the next dispatch.
    TurnComplete,
    /// Finished, with the reason.
    Terminal(TerminationReason),
}

impl TrajectoryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrajectoryState::Terminal(_))
    }
}

// ---------------------------------------------------------------------------
// Full trajectory
// ---------------------------------------------------------------------------

/// A complete multi-turn rollout for one task sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique identifier (UUID v4).
    pub id: Uuid,
    /// Task this rollout started from.
    pub task_id: String,
    /// Sample index within the task's group (`0..n_samples_per_prompt`).
    pub sample_index: usize,
    /// Ordered sequence of turns.
    pub turns: Vec<Turn>,
    /// Total accumulated reward over the rollout.
    pub total_reward: f64,
    /// Why the rollout stopped.
    pub termination: TerminationReason,
}

impl Trajectory {
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Whether the task goal was reached.
    pub fn succeeded(&self) -> bool {
        self.termination == TerminationReason::GoalReached
    }

    /// Tokens generated across all turns.
    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|t| t.tokens).sum()
    }
}

// ---------------------------------------------------------------------------
// Trajectory group (per prompt)
// ---------------------------------------------------------------------------

/// All samples drawn for one task prompt.
///
/// Group-relative advantage estimation consumes rewards per group, so the
/// group is the indivisible unit of batch assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryGroup {
    /// The originating task.
    pub task_id: String,
    /// The shared prompt all samples started from.
    pub prompt: String,
    /// The sampled trajectories.
    pub trajectories: Vec<Trajectory>,
}

impl TrajectoryGroup {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            trajectories: Vec::new(),
        }
    }

    /// Number of trajectories in the group.
    pub fn group_size(&self) -> usize {
        self.trajectories.len()
    }

    /// Mean reward across the group (the group-relative baseline).
    pub fn mean_reward(&self) -> f64 {
        if self.trajectories.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.trajectories.iter().map(|t| t.total_reward).sum();
        sum / self.trajectories.len() as f64
    }

    /// Standard deviation of rewards (used for normalisation).
    pub fn reward_std(&self) -> f64 {
        if self.trajectories.len() < 2 {
            return 1.0; // avoid division by zero
        }
        let mean = self.mean_reward();
        let var: f64 = self
            .trajectories
            .iter()
            .map(|t| (t.total_reward - mean).powi(2))
            .sum::<f64>()
            / (self.trajectories.len() as f64 - 1.0);
        var.sqrt().max(1e-8)
    }

    /// Group-relative advantage for each trajectory:
    /// `advantage_i = (r_i - mean(r)) / std(r)`.
    pub fn advantages(&self) -> Vec<f64> {
        let mean = self.mean_reward();
        let std = self.reward_std();
        self.trajectories
            .iter()
            .map(|t| (t.total_reward - mean) / std)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Training batch
// ---------------------------------------------------------------------------

/// One consumable training batch: whole groups only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingBatch {
    pub groups: Vec<TrajectoryGroup>,
}

impl TrainingBatch {
    /// Assemble a batch, enforcing the grouping invariant: every group has
    /// exactly `n_samples_per_prompt` members.
    pub fn from_groups(groups: Vec<TrajectoryGroup>, n_samples_per_prompt: usize) -> Result<Self> {
        for group in &groups {
            if group.group_size() != n_samples_per_prompt {
                return Err(Error::Invariant(format!(
                    "group for task {} has {} trajectories, expected {}",
                    group.task_id,
                    group.group_size(),
                    n_samples_per_prompt
                )));
            }
        }
        Ok(Self { groups })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn trajectory_count(&self) -> usize {
        self.groups.iter().map(|g| g.group_size()).sum()
    }

    /// Turns generated across the whole batch.
    pub fn total_turns(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.trajectories.iter())
            .map(|t| t.turn_count())
            .sum()
    }

    /// Mean reward over every trajectory in the batch.
    pub fn mean_reward(&self) -> f64 {
        let n = self.trajectory_count();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .groups
            .iter()
            .flat_map(|g| g.trajectories.iter())
            .map(|t| t.total_reward)
            .sum();
        sum / n as f64
    }

    /// Fraction of trajectories that reached their goal.
    pub fn success_rate(&self) -> f64 {
        let n = self.trajectory_count();
        if n == 0 {
            return 0.0;
        }
        let successes = self
            .groups
            .iter()
            .flat_map(|g| g.trajectories.iter())
            .filter(|t| t.succeeded())
            .count();
        successes as f64 / n as f64
    }

    /// Iterate over every trajectory in group order.
    pub fn trajectories(&self) -> impl Iterator<Item = &Trajectory> {
        self.groups.iter().flat_map(|g| g.trajectories.iter())
    }
}

// ---------------------------------------------------------------------------
// Shared step budget
// ---------------------------------------------------------------------------

/// Shared turn budget across one batch.
///
/// Acquisition happens before dispatch; a turn that acquired its slot runs
/// to completion even if the budget empties meanwhile. `None` disables the
/// limit.
#[derive(Debug)]
pub struct StepBudget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl StepBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Try to take one turn from the budget. Returns `false` once the
    /// budget is exhausted.
    pub fn try_acquire(&self) -> bool {
        match self.limit {
            None => {
                self.used.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(limit) => self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    if used < limit {
                        Some(used + 1)
                    } else {
                        None
                    }
                })
                .is_ok(),
        }
    }

    /// Turns acquired so far.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> bool {
        match self.limit {
            None => false,
            Some(limit) => self.used() >= limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn trajectory(task: &str, sample: usize, reward: f64) -> Trajectory {
        Trajectory {
            id: Uuid::new_v4(),
            task_id: task.into(),
            sample_index: sample,
            turns: vec![Turn {
                prompt: "p".into(),
                completion: "c".into(),
                observation: Some("obs".into()),
                reward,
                turn_index: 0,
                weight_version: 1,
                tokens: 2,
            }],
            total_reward: reward,
            termination: if reward > 0.0 {
                TerminationReason::GoalReached
            } else {
                TerminationReason::MaxTurns
            },
        }
    }

    fn group_of(task: &str, rewards: &[f64]) -> TrajectoryGroup {
        let mut group = TrajectoryGroup::new(task, format!("prompt for {task}"));
        for (i, &r) in rewards.iter().enumerate() {
            group.trajectories.push(trajectory(task, i, r));
        }
        group
    }

    #[test]
    fn test_group_statistics() {
        let group = group_of("t1", &[1.0, 0.0, 1.0, 0.0]);
        assert_eq!(group.group_size(), 4);
        assert!((group.mean_reward() - 0.5).abs() < 1e-12);

        let advantages = group.advantages();
        assert_eq!(advantages.len(), 4);
        // Symmetric rewards: advantages mirror around zero.
        assert!((advantages[0] + advantages[1]).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_rewards_have_bounded_advantages() {
        let group = group_of("t1", &[1.0, 1.0, 1.0]);
        // Zero variance hits the std floor instead of dividing by zero.
        for a in group.advantages() {
            assert!(a.abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_enforces_group_size() {
        let groups = vec![group_of("t1", &[1.0, 0.0]), group_of("t2", &[0.0, 1.0])];
        let batch = TrainingBatch::from_groups(groups, 2).unwrap();
        assert_eq!(batch.group_count(), 2);
        assert_eq!(batch.trajectory_count(), 4);
        assert!((batch.success_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_batch_rejects_split_group() {
        let groups = vec![group_of("t1", &[1.0, 0.0]), group_of("t2", &[0.0])];
        let err = TrainingBatch::from_groups(groups, 2).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_termination_reason_serde_names() {
        let json = serde_json::to_string(&TerminationReason::GoalReached).unwrap();
        assert_eq!(json, "\"goal_reached\"");
        let json = serde_json::to_string(&TerminationReason::StepLimit).unwrap();
        assert_eq!(json, "\"step_limit\"");
        let json = serde_json::to_string(&TerminationReason::GenerationError).unwrap();
        assert_eq!(json, "\"generation_error\"");
    }

    #[test]
    fn test_step_budget_caps_acquisition() {
        let budget = StepBudget::new(Some(3));
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        assert_eq!(budget.used(), 3);
        assert!(budget.exhausted());

        let unlimited = StepBudget::new(None);
        for _ in 0..100 {
            assert!(unlimited.try_acquire());
        }
        assert!(!unlimited.exhausted());
    }

    #[tokio::test]
    async fn test_step_budget_is_safe_under_contention() {
        let budget = Arc::new(StepBudget::new(Some(10)));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let budget = Arc::clone(&budget);
            handles.push(tokio::spawn(async move { budget.try_acquire() }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(budget.used(), 10);
    }

    #[test]
    fn test_trajectory_state_lifecycle() {
        assert!(!TrajectoryState::Pending.is_terminal());
        assert!(!TrajectoryState::AwaitingEngine.is_terminal());
        assert!(!TrajectoryState::TurnComplete.is_terminal());
        assert!(TrajectoryState::Terminal(TerminationReason::StepLimit).is_terminal());
    }
}
