//! The training run: wiring and the phase loop.
//!
//! One optimizer step walks four strictly ordered phases:
//!
//! ```text
//! generate ──► train ──► sync ──► (checkpoint / eval if due) ──► generate ...
//! ```
//!
//! - **generate**: the rollout orchestrator drives a prompt batch to
//!   terminal trajectories; the trainer is idle.
//! - **train**: the trainer consumes the batch and produces weight version
//!   N+1. On colocated placements the engine pool sleeps first and wakes
//!   after, since trainer and engines share devices.
//! - **sync**: the synchronizer broadcasts version N+1 to every engine.
//!   Generation for version N+1 cannot begin before the sync resolves, so
//!   no engine ever serves a version it has not acknowledged.
//! - **checkpoint / eval**: on their cadences, after the sync and before
//!   the next generate phase.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::OrchestratorConfig;
use crate::engine::{EnginePool, HttpEngine, InferenceEngine, LocalEngine};
use crate::error::Error;
use crate::eval::EvalScheduler;
use crate::placement::PlacementPlan;
use crate::rollout::{
    Environment, PromptSet, RolloutOptions, RolloutOrchestrator, TrajectoryStore,
};
use crate::sync::{SyncTransport, WeightSynchronizer};
use crate::trainer::{InMemoryBackend, PolicyTrainer};

/// Per-step record returned by [`TrainingRun::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub step: u64,
    pub loss: f64,
    pub grad_norm: f64,
    pub mean_reward: f64,
    pub success_rate: f64,
    /// Turn dispatches charged against the step budget this batch.
    pub dispatched_turns: usize,
    /// Engines that acknowledged the post-step sync.
    pub engines_acked: usize,
    pub engines_total: usize,
    /// Success rate of the eval pass that ran after this step, if one did.
    pub eval_success_rate: Option<f64>,
}

/// Owns every collaborator of one training run and drives the phase loop.
pub struct TrainingRun<E> {
    config: OrchestratorConfig,
    plan: PlacementPlan,
    orchestrator: RolloutOrchestrator<E>,
    synchronizer: WeightSynchronizer,
    trainer: PolicyTrainer<InMemoryBackend>,
    checkpoints: CheckpointManager,
    eval: EvalScheduler,
    store: Option<TrajectoryStore>,
    prompts: PromptSet,
}

impl<E: Environment> TrainingRun<E> {
    /// Validate the placement, construct the engines it calls for, and wire
    /// every collaborator. Fails fast on an unsatisfiable configuration.
    pub async fn new(config: OrchestratorConfig, env: E, prompts: PromptSet) -> Result<Self> {
        let plan = PlacementPlan::build(&config.placement)?;
        info!(
            devices = plan.total_devices(),
            engines = plan.num_engines(),
            colocated = plan.is_colocated(),
            "Placement plan built"
        );
        tracing::debug!(plan = %plan.render(), "Device assignments");

        let pool = EnginePool::new();
        for engine in build_engines(&config, &plan)? {
            pool.register(engine).await;
        }

        let synchronizer = WeightSynchronizer::new(
            pool.clone(),
            SyncTransport::from_config(config.sync.transport),
            Duration::from_secs(config.sync.ack_timeout_secs),
        );
        let trainer = PolicyTrainer::new(
            InMemoryBackend::from_config(&config.trainer),
            config.trainer.seed,
        );
        let checkpoints = CheckpointManager::from_config(&config.checkpoint);
        let eval = EvalScheduler::from_config(&config.eval, &config.rollout, &config.engine);
        let store = config.rollout.dump_dir.as_ref().map(TrajectoryStore::new);
        let orchestrator = RolloutOrchestrator::new(pool, env);

        Ok(Self {
            config,
            plan,
            orchestrator,
            synchronizer,
            trainer,
            checkpoints,
            eval,
            store,
            prompts,
        })
    }

    pub fn plan(&self) -> &PlacementPlan {
        &self.plan
    }

    pub fn pool(&self) -> &EnginePool {
        self.orchestrator.pool()
    }

    /// Completed optimizer steps.
    pub fn trainer_step(&self) -> u64 {
        self.trainer.step()
    }

    /// Run the phase loop until `trainer.total_steps` optimizer steps have
    /// completed, resuming from the latest checkpoint when one exists.
    pub async fn execute(&mut self) -> Result<Vec<RunMetrics>> {
        match self
            .checkpoints
            .load_latest()
            .context("Scanning checkpoints failed")?
        {
            Some(record) => {
                self.trainer
                    .restore(record.state)
                    .context("Restoring trainer state failed")?;
            }
            None if self.config.checkpoint.require_resume => {
                anyhow::bail!(
                    "resume required but no checkpoint found under {}",
                    self.checkpoints.root().display()
                );
            }
            None => {}
        }

        // All engines start on the trainer's current version, whether that
        // is the initial weights or a restored checkpoint.
        let initial = self
            .synchronizer
            .sync(&self.trainer.current_weights())
            .await
            .context("Initial weight sync failed")?;
        info!(
            version = initial.version,
            acked = initial.acked.len(),
            "Initial weights broadcast"
        );

        if self.eval.run_before_training() {
            self.eval
                .run(&self.orchestrator, &self.prompts, self.trainer.step())
                .await
                .context("Pre-training evaluation failed")?;
        }

        let total_steps = self.config.trainer.total_steps;
        let options = RolloutOptions::from_config(&self.config.rollout, &self.config.engine);
        let mut metrics = Vec::new();

        while self.trainer.step() < total_steps {
            let completed = self.trainer.step();
            let tasks = self
                .prompts
                .train_batch(completed, self.config.rollout.prompts_per_batch);
            if tasks.is_empty() {
                anyhow::bail!("prompt set has no training split");
            }

            // Generate: engines serve, trainer idle.
            let outcome = self
                .orchestrator
                .run_batch(&tasks, &options)
                .await
                .with_context(|| format!("Rollout for step {} failed", completed + 1))?;

            if let Some(store) = &self.store {
                if let Err(e) = store.dump_batch(completed + 1, &outcome.batch) {
                    warn!(error = %e, "Failed to dump trajectory batch");
                }
            }

            // Train. Colocated placements hand the devices over first.
            if self.plan.is_colocated() {
                self.pool()
                    .sleep_all()
                    .await
                    .context("Engine sleep before training failed")?;
            }
            let report = self
                .trainer
                .consume(&outcome.batch)
                .await
                .context("Training step failed")?;
            if self.plan.is_colocated() {
                self.pool()
                    .wake_all()
                    .await
                    .context("Engine wake after training failed")?;
            }

            // Sync: the new version reaches every engine before any further
            // dispatch.
            let sync_report = self
                .synchronizer
                .sync(&self.trainer.current_weights())
                .await
                .with_context(|| format!("Weight sync at step {} failed", report.step))?;

            if self.checkpoints.due(report.step) {
                self.checkpoints
                    .save(&self.trainer.state())
                    .context("Checkpoint save failed")?;
            }

            let eval_success_rate = if self.eval.due(report.step) {
                let eval_report = self
                    .eval
                    .run(&self.orchestrator, &self.prompts, report.step)
                    .await
                    .context("Evaluation failed")?;
                Some(eval_report.success_rate)
            } else {
                None
            };

            metrics.push(RunMetrics {
                step: report.step,
                loss: report.loss,
                grad_norm: report.grad_norm,
                mean_reward: report.mean_reward,
                success_rate: report.success_rate,
                dispatched_turns: outcome.dispatched_turns,
                engines_acked: sync_report.acked.len(),
                engines_total: sync_report.attempted,
                eval_success_rate,
            });
        }

        // A final record so a follow-up run resumes from the end.
        if self.config.checkpoint.interval > 0 && !self.checkpoints.due(self.trainer.step()) {
            self.checkpoints
                .save(&self.trainer.state())
                .context("Final checkpoint save failed")?;
        }

        if let Some(last) = metrics.last() {
            info!(
                steps = metrics.len(),
                final_step = last.step,
                final_success_rate = format!("{:.2}%", last.success_rate * 100.0),
                final_loss = last.loss,
                "Training run complete"
            );
        } else {
            info!("Training run complete (nothing left to do)");
        }
        Ok(metrics)
    }
}

/// Engines per the placement plan: remote endpoints when configured,
/// in-process deterministic engines otherwise.
pub fn build_engines(
    config: &OrchestratorConfig,
    plan: &PlacementPlan,
) -> Result<Vec<Arc<dyn InferenceEngine>>> {
    let tp_size = plan.engine_tp_size();
    if !config.engine.remote_urls.is_empty() {
        if config.engine.remote_urls.len() != plan.num_engines() {
            return Err(Error::Configuration(format!(
                "{} remote engine urls for {} planned engines",
                config.engine.remote_urls.len(),
                plan.num_engines()
            ))
            .into());
        }
        return Ok(config
            .engine
            .remote_urls
            .iter()
            .map(|url| {
                Arc::new(HttpEngine::new(
                    url,
                    tp_size,
                    config.engine.generate_timeout_secs,
                )) as Arc<dyn InferenceEngine>
            })
            .collect());
    }

    Ok((0..plan.num_engines())
        .map(|replica| {
            // Offset keeps the engine streams apart from the backend's.
            let seed = config.trainer.seed.wrapping_add(replica as u64 + 1);
            Arc::new(LocalEngine::new(replica, tp_size, seed)) as Arc<dyn InferenceEngine>
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::rollout::HashScoredEnv;

    fn test_config(dir: &std::path::Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.trainer.total_steps = 3;
        config.trainer.param_count = 64;
        config.rollout.prompts_per_batch = 2;
        config.rollout.n_samples_per_prompt = 2;
        config.rollout.max_turns = 2;
        config.checkpoint.dir = dir.join("ckpt").to_string_lossy().into_owned();
        config.checkpoint.interval = 2;
        config.eval.interval = 2;
        config.eval.prompts_per_eval = 2;
        config
    }

    #[tokio::test]
    async fn test_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.rollout.dump_dir =
            Some(dir.path().join("dumps").to_string_lossy().into_owned());

        let prompts = PromptSet::synthetic(4, 2);
        let mut run = TrainingRun::new(config, HashScoredEnv::new(2), prompts)
            .await
            .unwrap();
        let metrics = run.execute().await.unwrap();

        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics.last().unwrap().step, 3);
        assert_eq!(run.trainer_step(), 3);

        // Every engine finished healthy on the final version.
        assert_eq!(run.pool().healthy_count().await, 2);
        for view in run.pool().healthy_views().await {
            assert_eq!(view.weight_version, 3);
        }

        // Eval ran on its cadence only.
        assert!(metrics[0].eval_success_rate.is_none());
        assert!(metrics[1].eval_success_rate.is_some());
        assert!(metrics[2].eval_success_rate.is_none());

        // One dump per step; checkpoint at the cadence step plus the final.
        let store = TrajectoryStore::new(dir.path().join("dumps"));
        assert_eq!(store.list_steps().unwrap(), vec![1, 2, 3]);
        let checkpoints = CheckpointManager::new(dir.path().join("ckpt"), 2, None);
        assert_eq!(checkpoints.list_steps().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_run_resumes_from_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.trainer.total_steps = 2;
        config.checkpoint.interval = 1;
        config.eval.interval = 0;

        let prompts = PromptSet::synthetic(4, 0);
        let mut first = TrainingRun::new(config.clone(), HashScoredEnv::new(2), prompts.clone())
            .await
            .unwrap();
        first.execute().await.unwrap();
        assert_eq!(first.trainer_step(), 2);
        let weights_after_two = first.trainer.current_weights();

        // A later run with a higher step target picks up where it left off.
        config.trainer.total_steps = 4;
        let mut second = TrainingRun::new(config, HashScoredEnv::new(2), prompts)
            .await
            .unwrap();
        let metrics = second.execute().await.unwrap();

        assert_eq!(second.trainer_step(), 4);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].step, 3);
        assert_ne!(
            second.trainer.current_weights().digest(),
            weights_after_two.digest()
        );
    }

    #[tokio::test]
    async fn test_colocated_run_alternates_phases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.trainer.total_steps = 1;
        config.checkpoint.interval = 0;
        config.eval.interval = 0;
        config.placement.gpus_per_node = 4;
        config.placement.policy_gpus_per_node = 4;
        config.placement.reference_gpus_per_node = 4;
        config.placement.num_engines = 4;
        config.placement.colocate_all = true;

        let prompts = PromptSet::synthetic(4, 0);
        let mut run = TrainingRun::new(config, HashScoredEnv::new(2), prompts)
            .await
            .unwrap();
        assert!(run.plan().is_colocated());
        run.execute().await.unwrap();

        // The pool was woken after the last train phase and is serving the
        // new version.
        for view in run.pool().healthy_views().await {
            assert!(view.engine.healthcheck().await.is_ok());
            assert_eq!(view.weight_version, 1);
        }
    }

    #[tokio::test]
    async fn test_remote_url_count_must_match_plan() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.engine.remote_urls = vec!["http://localhost:9999".into()];

        let result =
            TrainingRun::new(config, HashScoredEnv::new(2), PromptSet::synthetic(2, 0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_train_split_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.eval.interval = 0;

        let mut run = TrainingRun::new(config, HashScoredEnv::new(2), PromptSet::synthetic(0, 0))
            .await
            .unwrap();
        assert!(run.execute().await.is_err());
    }

    #[tokio::test]
    async fn test_require_resume_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.checkpoint.require_resume = true;
        config.eval.interval = 0;

        let mut run = TrainingRun::new(config, HashScoredEnv::new(2), PromptSet::synthetic(4, 0))
            .await
            .unwrap();
        let err = run.execute().await.unwrap_err();
        assert!(err.to_string().contains("resume required"));
    }
}
