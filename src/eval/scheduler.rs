//! Held-out evaluation on the training cadence.
//!
//! Evaluation reuses the rollout orchestrator with its own sampling
//! parameters (usually greedy) and one sample per prompt, and never touches
//! trainer state. The run loop schedules it strictly between a completed
//! weight sync and the next generate phase, so every eval turn is served by
//! one stable weight version; the report records that version and the
//! scheduler verifies it was uniform.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{EngineConfig, EvalConfig, RolloutConfig};
use crate::engine::api::SamplingParams;
use crate::error::{Error, Result};
use crate::rollout::env::{Environment, PromptSet};
use crate::rollout::orchestrator::{RolloutOptions, RolloutOrchestrator};
use crate::rollout::trajectory::{TerminationReason, TrainingBatch};

/// One evaluated prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvalSummary {
    pub task_id: String,
    pub reward: f64,
    pub turns: usize,
    pub termination: TerminationReason,
}

/// Aggregate results of one evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    /// Trainer step the evaluation ran at.
    pub step: u64,
    /// The single weight version every eval turn was served by.
    pub weight_version: u64,
    pub prompts: usize,
    pub mean_reward: f64,
    pub min_reward: f64,
    pub max_reward: f64,
    pub success_rate: f64,
    pub mean_turns: f64,
    pub per_task: Vec<TaskEvalSummary>,
}

/// Decides when evaluation runs and drives it when due.
pub struct EvalScheduler {
    interval: u64,
    before_training: bool,
    prompts_per_eval: usize,
    options: RolloutOptions,
}

impl EvalScheduler {
    pub fn from_config(eval: &EvalConfig, rollout: &RolloutConfig, engine: &EngineConfig) -> Self {
        let options = RolloutOptions {
            // One sample per prompt: eval wants the policy's answer, not a
            // group for advantage estimation.
            n_samples_per_prompt: 1,
            max_turns: rollout.max_turns,
            step_limit: None,
            batched: rollout.batched,
            async_engine: engine.async_engine,
            sampling: SamplingParams {
                temperature: eval.temperature,
                top_p: engine.sampling.top_p,
                max_tokens: engine.sampling.max_generate_tokens,
            },
            generate_timeout: std::time::Duration::from_secs(engine.generate_timeout_secs),
        };
        Self {
            interval: eval.interval,
            before_training: eval.before_training,
            prompts_per_eval: eval.prompts_per_eval,
            options,
        }
    }

    /// Whether `step` is on the eval cadence (never for interval 0).
    pub fn due(&self, step: u64) -> bool {
        self.interval > 0 && step > 0 && step % self.interval == 0
    }

    /// Whether a pass should run before the first training step.
    pub fn run_before_training(&self) -> bool {
        self.before_training
    }

    /// Evaluate the current policy over the held-out split.
    pub async fn run<E: Environment>(
        &self,
        orchestrator: &RolloutOrchestrator<E>,
        prompts: &PromptSet,
        step: u64,
    ) -> Result<EvalReport> {
        let tasks = prompts.eval_batch(self.prompts_per_eval);
        if tasks.is_empty() {
            return Err(Error::Configuration(
                "evaluation requested but the prompt set has no eval split".into(),
            ));
        }

        let version_before = orchestrator
            .pool()
            .healthy_views()
            .await
            .first()
            .map(|v| v.weight_version)
            .unwrap_or(0);

        let outcome = orchestrator.run_batch(&tasks, &self.options).await?;
        let weight_version = stable_version_of(&outcome.batch, version_before)?;

        let per_task: Vec<TaskEvalSummary> = outcome
            .batch
            .trajectories()
            .map(|t| TaskEvalSummary {
                task_id: t.task_id.clone(),
                reward: t.total_reward,
                turns: t.turn_count(),
                termination: t.termination,
            })
            .collect();

        let rewards: Vec<f64> = per_task.iter().map(|t| t.reward).collect();
        let min_reward = rewards
            .iter()
            .copied()
            .min_by_key(|r| OrderedFloat(*r))
            .unwrap_or(0.0);
        let max_reward = rewards
            .iter()
            .copied()
            .max_by_key(|r| OrderedFloat(*r))
            .unwrap_or(0.0);
        let mean_turns = per_task.iter().map(|t| t.turns).sum::<usize>() as f64
            / per_task.len() as f64;

        let report = EvalReport {
            step,
            weight_version,
            prompts: tasks.len(),
            mean_reward: outcome.batch.mean_reward(),
            min_reward,
            max_reward,
            success_rate: outcome.batch.success_rate(),
            mean_turns,
            per_task,
        };
        info!(
            step,
            weight_version,
            prompts = report.prompts,
            mean_reward = format!("{:.3}", report.mean_reward),
            success_rate = format!("{:.2}", report.success_rate),
            mean_turns = format!("{:.2}", report.mean_turns),
            "Evaluation complete"
        );
        Ok(report)
    }
}

/// The uniform weight version across all eval turns.
///
/// A mixed batch would mean a sync interleaved with evaluation, which the
/// run loop's phase ordering is supposed to make impossible.
fn stable_version_of(batch: &TrainingBatch, fallback: u64) -> Result<u64> {
    let mut version = None;
    for trajectory in batch.trajectories() {
        for turn in &trajectory.turns {
            match version {
                None => version = Some(turn.weight_version),
                Some(v) if v != turn.weight_version => {
                    return Err(Error::Invariant(format!(
                        "evaluation saw weight versions {v} and {}; a sync overlapped eval",
                        turn.weight_version
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(version.unwrap_or(fallback))
}
