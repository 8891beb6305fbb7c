//! Rollout orchestration: driving batches of multi-turn trajectories.
//!
//! The [`RolloutOrchestrator`] repeatedly:
//!   1. builds the prompt context for every trajectory that is ready,
//!   2. dispatches generation requests to healthy engines,
//!   3. folds the environment's feedback into the completed turn,
//!   4. advances each trajectory's state machine
//!      (`Pending -> AwaitingEngine -> (TurnComplete -> AwaitingEngine)* -> Terminal`).
//!
//! It supports two dispatch modes:
//! - **Batched** via one `generate` call per engine per round, covering all
//!   currently-ready trajectories.
//! - **Async** where each trajectory progresses as its own task, suspending
//!   at its own engine call.
//!
//! The shared step budget counts turns actually handed to an engine: it is
//! acquired right before dispatch. An in-flight turn always completes and
//! is kept; only new dispatches are cut.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::{EngineConfig, RolloutConfig};
use crate::engine::api::{GenerationOutput, GenerationRequest, SamplingParams};
use crate::engine::pool::{EnginePool, EngineView};
use crate::error::{Error, Result};

use super::env::{Environment, TaskRecord, TurnFeedback};
use super::trajectory::{
    StepBudget, TerminationReason, TrainingBatch, Trajectory, TrajectoryGroup, TrajectoryState,
    Turn,
};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-run knobs for a rollout batch.
#[derive(Debug, Clone)]
pub struct RolloutOptions {
    /// Trajectories sampled per prompt.
    pub n_samples_per_prompt: usize,
    /// Per-trajectory turn cap.
    pub max_turns: usize,
    /// Shared turn budget for the whole batch; `None` disables it.
    pub step_limit: Option<usize>,
    /// Batched rounds vs independent per-trajectory tasks.
    pub batched: bool,
    /// Engines accept single requests as they arrive. Per-trajectory
    /// dispatch needs this; batched rounds work either way.
    pub async_engine: bool,
    pub sampling: SamplingParams,
    /// Timeout for one engine call.
    pub generate_timeout: Duration,
}

impl RolloutOptions {
    pub fn from_config(rollout: &RolloutConfig, engine: &EngineConfig) -> Self {
        Self {
            n_samples_per_prompt: rollout.n_samples_per_prompt,
            max_turns: rollout.max_turns,
            step_limit: rollout.step_limit,
            batched: rollout.batched,
            async_engine: engine.async_engine,
            sampling: SamplingParams::from_config(&engine.sampling),
            generate_timeout: Duration::from_secs(engine.generate_timeout_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.n_samples_per_prompt == 0 {
            return Err(Error::Configuration(
                "n_samples_per_prompt must be at least 1".into(),
            ));
        }
        if self.max_turns == 0 {
            return Err(Error::Configuration("max_turns must be at least 1".into()));
        }
        if !self.batched && !self.async_engine {
            return Err(Error::Configuration(
                "batched = false requires async_engine = true; a blocking engine \
                 only serves one batch call per round"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// What a finished batch looks like to the caller.
#[derive(Debug, Clone)]
pub struct RolloutOutcome {
    pub batch: TrainingBatch,
    /// Turn dispatches charged against the step budget.
    pub dispatched_turns: usize,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// In-flight bookkeeping
// ---------------------------------------------------------------------------

/// One trajectory while the orchestrator is still writing it.
struct ActiveTrajectory {
    id: Uuid,
    task_index: usize,
    sample_index: usize,
    turns: Vec<Turn>,
    state: TrajectoryState,
}

impl ActiveTrajectory {
    fn new(task_index: usize, sample_index: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_index,
            sample_index,
            turns: Vec::new(),
            state: TrajectoryState::Pending,
        }
    }

    fn is_ready(&self) -> bool {
        matches!(
            self.state,
            TrajectoryState::Pending | TrajectoryState::TurnComplete
        )
    }

    fn terminate(&mut self, reason: TerminationReason) {
        self.state = TrajectoryState::Terminal(reason);
    }

    /// Seal the trajectory. Fails if the state machine was left mid-flight,
    /// which would be an orchestrator bug.
    fn into_trajectory(self, task: &TaskRecord) -> Result<Trajectory> {
        let termination = match self.state {
            TrajectoryState::Terminal(reason) => reason,
            other => {
                return Err(Error::Invariant(format!(
                    "trajectory {} for task {} left non-terminal ({other:?})",
                    self.id, task.id
                )))
            }
        };
        let total_reward = self.turns.iter().map(|t| t.reward).sum();
        Ok(Trajectory {
            id: self.id,
            task_id: task.id.clone(),
            sample_index: self.sample_index,
            turns: self.turns,
            total_reward,
            termination,
        })
    }
}

/// Prompt context for the next turn: the task prompt followed by the
/// completed action/observation exchanges.
fn build_prompt(task: &TaskRecord, turns: &[Turn]) -> String {
    let mut prompt = task.prompt.clone();
    for turn in turns {
        prompt.push_str("\n[action] ");
        prompt.push_str(&turn.completion);
        if let Some(obs) = &turn.observation {
            prompt.push_str("\n[observation] ");
            prompt.push_str(obs);
        }
    }
    prompt
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives trajectory batches against the engine pool and an environment.
pub struct RolloutOrchestrator<E> {
    pool: EnginePool,
    env: E,
}

impl<E: Environment> RolloutOrchestrator<E> {
    pub fn new(pool: EnginePool, env: E) -> Self {
        Self { pool, env }
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    /// Run every task to a terminal state and assemble the training batch.
    ///
    /// Each task contributes exactly `n_samples_per_prompt` trajectories and
    /// groups are never split: the returned batch is the whole batch.
    pub async fn run_batch(
        &self,
        tasks: &[TaskRecord],
        options: &RolloutOptions,
    ) -> Result<RolloutOutcome> {
        options.validate()?;
        let started = Instant::now();

        if tasks.is_empty() {
            return Ok(RolloutOutcome {
                batch: TrainingBatch::from_groups(Vec::new(), options.n_samples_per_prompt)?,
                dispatched_turns: 0,
                elapsed: started.elapsed(),
            });
        }

        let version = self.consensus_version().await?;
        let budget = StepBudget::new(options.step_limit);

        let mut active: Vec<ActiveTrajectory> = Vec::new();
        for task_index in 0..tasks.len() {
            for sample_index in 0..options.n_samples_per_prompt {
                active.push(ActiveTrajectory::new(task_index, sample_index));
            }
        }

        if options.batched {
            self.run_batched(tasks, options, version, &budget, &mut active)
                .await?;
        } else {
            active = self
                .run_async(tasks, options, version, &budget, active)
                .await;
        }

        // Assemble groups in construction order; sealing verifies terminal
        // totality.
        let mut groups: Vec<TrajectoryGroup> = tasks
            .iter()
            .map(|t| TrajectoryGroup::new(t.id.clone(), t.prompt.clone()))
            .collect();
        for trajectory in active {
            let task_index = trajectory.task_index;
            let sealed = trajectory.into_trajectory(&tasks[task_index])?;
            groups[task_index].trajectories.push(sealed);
        }

        let batch = TrainingBatch::from_groups(groups, options.n_samples_per_prompt)?;
        let outcome = RolloutOutcome {
            dispatched_turns: budget.used(),
            elapsed: started.elapsed(),
            batch,
        };
        tracing::info!(
            tasks = tasks.len(),
            trajectories = outcome.batch.trajectory_count(),
            turns = outcome.batch.total_turns(),
            dispatched = outcome.dispatched_turns,
            success_rate = format!("{:.2}", outcome.batch.success_rate()),
            "Rollout batch complete"
        );
        Ok(outcome)
    }

    /// The single weight version every healthy engine currently serves.
    ///
    /// Disagreement means a sync is mid-flight or was interleaved with
    /// dispatch; refusing here keeps stale completions impossible.
    async fn consensus_version(&self) -> Result<u64> {
        let healthy = self.pool.healthy_views().await;
        let Some(first) = healthy.first() else {
            return Ok(0);
        };
        let version = first.weight_version;
        for view in &healthy[1..] {
            if view.weight_version != version {
                return Err(Error::Invariant(format!(
                    "healthy engines disagree on weight version ({} vs {}); dispatch refused",
                    version, view.weight_version
                )));
            }
        }
        Ok(version)
    }

    async fn engines_at(&self, version: u64) -> Vec<EngineView> {
        self.pool
            .healthy_views()
            .await
            .into_iter()
            .filter(|v| v.weight_version == version)
            .collect()
    }

    // -- batched mode --------------------------------------------------------

    async fn run_batched(
        &self,
        tasks: &[TaskRecord],
        options: &RolloutOptions,
        version: u64,
        budget: &StepBudget,
        active: &mut [ActiveTrajectory],
    ) -> Result<()> {
        let mut round = 0usize;
        loop {
            let ready: Vec<usize> = (0..active.len()).filter(|&i| active[i].is_ready()).collect();
            if ready.is_empty() {
                break;
            }

            // Engine lookup comes first: the budget counts turns actually
            // handed to an engine, so nothing is charged for a round that
            // cannot dispatch anywhere.
            let engines = self.engines_at(version).await;
            if engines.is_empty() {
                tracing::warn!(
                    stranded = ready.len(),
                    "No healthy engine at the current version; terminating ready trajectories"
                );
                for idx in ready {
                    active[idx].terminate(TerminationReason::GenerationError);
                }
                continue;
            }

            // Budget acquisition in trajectory-index order: deterministic
            // cut when the budget empties mid-round.
            let mut dispatch: Vec<usize> = Vec::new();
            for idx in ready {
                if budget.try_acquire() {
                    active[idx].state = TrajectoryState::AwaitingEngine;
                    dispatch.push(idx);
                } else {
                    active[idx].terminate(TerminationReason::StepLimit);
                }
            }
            if dispatch.is_empty() {
                continue;
            }

            round += 1;
            tracing::debug!(round, dispatching = dispatch.len(), engines = engines.len(), "Rollout round");

            // Partition the round across engines in contiguous chunks.
            let chunk_size = dispatch.len().div_ceil(engines.len());
            let mut calls = Vec::new();
            for (engine_slot, chunk) in dispatch.chunks(chunk_size).enumerate() {
                let view = engines[engine_slot].clone();
                let requests: Vec<(usize, GenerationRequest)> = chunk
                    .iter()
                    .map(|&idx| {
                        let tr = &active[idx];
                        let request = GenerationRequest {
                            trajectory_id: tr.id,
                            prompt: build_prompt(&tasks[tr.task_index], &tr.turns),
                            weight_version: version,
                            sampling: options.sampling.clone(),
                        };
                        (idx, request)
                    })
                    .collect();
                calls.push(self.call_engine(view, requests, options.generate_timeout));
            }
            let rounds: Vec<ChunkResult> = join_all(calls).await;

            // Fold feedback sequentially; the environment is a pure per-turn
            // call so this is cheap and keeps the ordering deterministic.
            for chunk in rounds {
                match chunk.outputs {
                    Ok(by_id) => {
                        for idx in chunk.indices {
                            let output = by_id.get(&active[idx].id).cloned();
                            self.complete_turn(tasks, options, &mut active[idx], output)
                                .await;
                        }
                    }
                    Err(reason) => {
                        self.pool.mark_unhealthy(chunk.engine_id).await;
                        tracing::warn!(
                            engine = %chunk.engine_id,
                            %reason,
                            stranded = chunk.indices.len(),
                            "Engine call failed; terminating its trajectories"
                        );
                        for idx in chunk.indices {
                            active[idx].terminate(TerminationReason::GenerationError);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One engine call for a chunk of trajectories, with timeout.
    async fn call_engine(
        &self,
        view: EngineView,
        requests: Vec<(usize, GenerationRequest)>,
        generate_timeout: Duration,
    ) -> ChunkResult {
        let indices: Vec<usize> = requests.iter().map(|(i, _)| *i).collect();
        let payload: Vec<GenerationRequest> = requests.into_iter().map(|(_, r)| r).collect();

        let outputs = match timeout(generate_timeout, view.engine.generate(payload)).await {
            Ok(Ok(outputs)) => {
                let by_id: HashMap<Uuid, GenerationOutput> = outputs
                    .into_iter()
                    .map(|o| (o.trajectory_id, o))
                    .collect();
                Ok(by_id)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "generation timed out after {}ms",
                generate_timeout.as_millis()
            )),
        };

        ChunkResult {
            engine_id: view.id,
            indices,
            outputs,
        }
    }

    /// Fold one completed engine output (or its absence) into a trajectory.
    async fn complete_turn(
        &self,
        tasks: &[TaskRecord],
        options: &RolloutOptions,
        tr: &mut ActiveTrajectory,
        output: Option<GenerationOutput>,
    ) {
        let Some(output) = output else {
            // The engine returned but skipped this request.
            tr.terminate(TerminationReason::GenerationError);
            return;
        };

        let task = &tasks[tr.task_index];
        let prompt = build_prompt(task, &tr.turns);
        let feedback = self.env.respond(task, &tr.turns, &output.text).await;

        let turn_index = tr.turns.len();
        match feedback {
            Ok(TurnFeedback {
                observation,
                reward,
                done,
                success,
            }) => {
                tr.turns.push(Turn {
                    prompt,
                    completion: output.text,
                    observation: Some(observation),
                    reward,
                    turn_index,
                    weight_version: output.weight_version,
                    tokens: output.tokens,
                });
                if done {
                    tr.terminate(if success {
                        TerminationReason::GoalReached
                    } else {
                        TerminationReason::TaskFailed
                    });
                } else if tr.turns.len() >= options.max_turns {
                    tr.terminate(TerminationReason::MaxTurns);
                } else {
                    tr.state = TrajectoryState::TurnComplete;
                }
            }
            Err(e) => {
                // Collaborator failure: the completion exists but cannot be
                // judged. Keep the turn, terminate on the failure path.
                tracing::warn!(trajectory = %tr.id, error = %e, "Environment rejected turn");
                tr.turns.push(Turn {
                    prompt,
                    completion: output.text,
                    observation: None,
                    reward: 0.0,
                    turn_index,
                    weight_version: output.weight_version,
                    tokens: output.tokens,
                });
                tr.terminate(TerminationReason::TaskFailed);
            }
        }
    }

    // -- async mode ----------------------------------------------------------

    async fn run_async(
        &self,
        tasks: &[TaskRecord],
        options: &RolloutOptions,
        version: u64,
        budget: &StepBudget,
        active: Vec<ActiveTrajectory>,
    ) -> Vec<ActiveTrajectory> {
        let drivers = active
            .into_iter()
            .map(|tr| self.drive_trajectory(tasks, options, version, budget, tr));
        join_all(drivers).await
    }

    /// Drive one trajectory to terminal, suspending at its own engine call.
    async fn drive_trajectory(
        &self,
        tasks: &[TaskRecord],
        options: &RolloutOptions,
        version: u64,
        budget: &StepBudget,
        mut tr: ActiveTrajectory,
    ) -> ActiveTrajectory {
        loop {
            if tr.state.is_terminal() {
                return tr;
            }
            // Engine lookup before the budget charge, same as the batched
            // path: an undispatchable turn must not consume a budget unit.
            let engines = self.engines_at(version).await;
            if engines.is_empty() {
                tr.terminate(TerminationReason::GenerationError);
                return tr;
            }
            if !budget.try_acquire() {
                tr.terminate(TerminationReason::StepLimit);
                return tr;
            }
            tr.state = TrajectoryState::AwaitingEngine;
            let view = engines[(tr.id.as_u128() % engines.len() as u128) as usize].clone();

            let request = GenerationRequest {
                trajectory_id: tr.id,
                prompt: build_prompt(&tasks[tr.task_index], &tr.turns),
                weight_version: version,
                sampling: options.sampling.clone(),
            };

            match timeout(options.generate_timeout, view.engine.generate(vec![request])).await {
                Ok(Ok(outputs)) => {
                    let output = outputs.into_iter().find(|o| o.trajectory_id == tr.id);
                    self.complete_turn(tasks, options, &mut tr, output).await;
                }
                Ok(Err(e)) => {
                    self.pool.mark_unhealthy(view.id).await;
                    tracing::warn!(engine = %view.id, error = %e, trajectory = %tr.id, "Engine call failed");
                    tr.terminate(TerminationReason::GenerationError);
                }
                Err(_) => {
                    self.pool.mark_unhealthy(view.id).await;
                    tracing::warn!(engine = %view.id, trajectory = %tr.id, "Engine call timed out");
                    tr.terminate(TerminationReason::GenerationError);
                }
            }
        }
    }
}

struct ChunkResult {
    engine_id: crate::engine::pool::EngineId,
    indices: Vec<usize>,
    outputs: std::result::Result<HashMap<Uuid, GenerationOutput>, String>,
}
