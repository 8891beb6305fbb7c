//! Baleen: RL post-training orchestration
//!
//! Provides subcommands for the pieces of the loop:
//!
//! - `train`    -- Run the full training loop (generate, train, sync, repeat)
//! - `plan`     -- Build and print the device placement plan
//! - `rollout`  -- Generate one trajectory batch with the initial weights
//! - `eval`     -- Run one evaluation pass with the initial weights
//! - `inspect`  -- Inspect checkpoints or trajectory dumps on disk

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use baleen::checkpoint::CheckpointManager;
use baleen::config::OrchestratorConfig;
use baleen::engine::EnginePool;
use baleen::eval::EvalScheduler;
use baleen::placement::PlacementPlan;
use baleen::rollout::{
    Environment, HashScoredEnv, PromptSet, RolloutOptions, RolloutOrchestrator, ScriptedEnv,
    SucceedAfterEnv, TaskRecord, TrajectoryStore, Turn, TurnFeedback,
};
use baleen::run::{build_engines, TrainingRun};
use baleen::sync::{SyncTransport, WeightSynchronizer};
use baleen::trainer::{InMemoryBackend, PolicyTrainer};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Baleen: RL post-training orchestration
#[derive(Parser)]
#[command(name = "baleen", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which mock environment judges completions.
    #[arg(long, global = true, default_value = "hash")]
    env: EnvChoice,

    /// JSON prompt file with "train" and "eval" task arrays; a synthetic
    /// set is generated when omitted.
    #[arg(long, global = true)]
    prompts: Option<PathBuf>,

    /// Training prompts in the synthetic dataset.
    #[arg(long, global = true, default_value_t = 32)]
    train_tasks: usize,

    /// Held-out prompts in the synthetic dataset.
    #[arg(long, global = true, default_value_t = 16)]
    eval_tasks: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum EnvChoice {
    /// Score completions by content hash; rewards vary across samples.
    Hash,
    /// Every task succeeds on its second turn.
    Succeed,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full training loop, resuming from the latest checkpoint.
    Train,

    /// Build the device placement plan and print it.
    Plan,

    /// Generate one trajectory batch with the initial weights and dump it.
    Rollout {
        /// Directory the batch dump is written into.
        #[arg(long, default_value = "data/rollouts")]
        output: PathBuf,
    },

    /// Run one evaluation pass over the held-out split.
    Eval,

    /// Inspect checkpoints or trajectory dumps on disk.
    Inspect {
        /// Directory holding per-step checkpoint records or batch dumps.
        #[arg(default_value = "data/checkpoints")]
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create configuration.
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<OrchestratorConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => OrchestratorConfig::default(),
    };

    let prompts = match &cli.prompts {
        Some(path) => PromptSet::from_json_file(path)
            .with_context(|| format!("Failed to load prompts from {}", path.display()))?,
        None => PromptSet::synthetic(cli.train_tasks, cli.eval_tasks),
    };

    match cli.command {
        Commands::Train => cmd_train(&config, create_env(&cli.env), prompts).await,
        Commands::Plan => cmd_plan(&config),
        Commands::Rollout { output } => {
            cmd_rollout(&config, create_env(&cli.env), prompts, &output).await
        }
        Commands::Eval => cmd_eval(&config, create_env(&cli.env), prompts).await,
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_train(config: &OrchestratorConfig, env: MockEnv, prompts: PromptSet) -> Result<()> {
    tracing::info!(total_steps = config.trainer.total_steps, "Starting training run");

    let mut run = TrainingRun::new(config.clone(), env, prompts).await?;
    let metrics = run.execute().await?;

    tracing::info!(steps_completed = metrics.len(), "Training run finished");
    Ok(())
}

fn cmd_plan(config: &OrchestratorConfig) -> Result<()> {
    let plan = PlacementPlan::build(&config.placement)?;
    print!("{}", plan.render());
    Ok(())
}

async fn cmd_rollout(
    config: &OrchestratorConfig,
    env: MockEnv,
    prompts: PromptSet,
    output: &PathBuf,
) -> Result<()> {
    let tasks = prompts.train_batch(0, config.rollout.prompts_per_batch);
    tracing::info!(tasks = tasks.len(), "Generating one trajectory batch");

    let pool = wire_pool(config).await?;
    broadcast_initial_weights(config, &pool).await?;

    let orchestrator = RolloutOrchestrator::new(pool, env);
    let options = RolloutOptions::from_config(&config.rollout, &config.engine);
    let outcome = orchestrator.run_batch(&tasks, &options).await?;

    let store = TrajectoryStore::new(output);
    let path = store.dump_batch(0, &outcome.batch)?;

    tracing::info!(
        path = %path.display(),
        trajectories = outcome.batch.trajectory_count(),
        turns = outcome.dispatched_turns,
        "Saved trajectory batch"
    );
    Ok(())
}

async fn cmd_eval(config: &OrchestratorConfig, env: MockEnv, prompts: PromptSet) -> Result<()> {
    let pool = wire_pool(config).await?;
    broadcast_initial_weights(config, &pool).await?;

    let orchestrator = RolloutOrchestrator::new(pool, env);
    let scheduler = EvalScheduler::from_config(&config.eval, &config.rollout, &config.engine);
    let report = scheduler.run(&orchestrator, &prompts, 0).await?;

    println!("Evaluation at weight version {}", report.weight_version);
    println!("  Prompts: {}", report.prompts);
    println!(
        "  Mean reward: {:.3} (min {:.3}, max {:.3})",
        report.mean_reward, report.min_reward, report.max_reward
    );
    println!("  Success rate: {:.2}%", report.success_rate * 100.0);
    println!("  Mean turns: {:.2}", report.mean_turns);
    println!();

    println!("Per task:");
    for task in &report.per_task {
        println!(
            "  {:<12} reward {:.3}  turns {}  {:?}",
            task.task_id, task.reward, task.turns, task.termination
        );
    }

    Ok(())
}

fn cmd_inspect(path: &PathBuf) -> Result<()> {
    let manager = CheckpointManager::new(path, 0, None);
    let ckpt_steps = manager.list_steps()?;
    let store = TrajectoryStore::new(path);
    let dump_steps = store.list_steps()?;

    if ckpt_steps.is_empty() && dump_steps.is_empty() {
        println!(
            "No checkpoints or trajectory dumps under {}",
            path.display()
        );
        return Ok(());
    }

    if !ckpt_steps.is_empty() {
        println!("Checkpoints: {}", path.display());
        for step in &ckpt_steps {
            match manager.load_step(*step) {
                Ok(record) => println!(
                    "  step {:>6}  saved {}  {:>8} bytes  digest {:016x}",
                    record.meta.step,
                    record.meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    record.meta.size_bytes,
                    record.meta.digest
                ),
                Err(e) => println!("  step {step:>6}  unreadable: {e}"),
            }
        }
        println!();

        if let Some(record) = manager.load_latest()? {
            println!("Latest resumable state:");
            println!("  Trainer step: {}", record.state.step);
            println!("  Seed: {}", record.state.seed);
            println!("  Parameters: {}", record.state.backend.weights.len());
            println!(
                "  Optimizer updates: {}",
                record.state.backend.updates_applied
            );
        }
    }

    if !dump_steps.is_empty() {
        println!("Trajectory dumps: {}", path.display());
        for step in &dump_steps {
            match store.read_dump(*step) {
                Ok(dump) => println!(
                    "  step {:>6}  {} trajectories  {} turns  mean reward {:.3}  success {:.1}%",
                    dump.step,
                    dump.trajectories,
                    dump.turns,
                    dump.mean_reward,
                    dump.success_rate * 100.0
                ),
                Err(e) => println!("  step {step:>6}  unreadable: {e}"),
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Shared wiring
// ---------------------------------------------------------------------------

async fn wire_pool(config: &OrchestratorConfig) -> Result<EnginePool> {
    let plan = PlacementPlan::build(&config.placement)?;
    let pool = EnginePool::new();
    for engine in build_engines(config, &plan)? {
        pool.register(engine).await;
    }
    Ok(pool)
}

/// One-shot commands still honour the sync discipline: engines serve only
/// versions they acknowledged, so the initial weights go out first.
async fn broadcast_initial_weights(config: &OrchestratorConfig, pool: &EnginePool) -> Result<()> {
    let trainer = PolicyTrainer::new(
        InMemoryBackend::from_config(&config.trainer),
        config.trainer.seed,
    );
    let mut synchronizer = WeightSynchronizer::new(
        pool.clone(),
        SyncTransport::from_config(config.sync.transport),
        Duration::from_secs(config.sync.ack_timeout_secs),
    );
    synchronizer.sync(&trainer.current_weights()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment construction
// ---------------------------------------------------------------------------

enum MockEnv {
    Hash(HashScoredEnv),
    Succeed(SucceedAfterEnv),
}

impl Environment for MockEnv {
    async fn respond(
        &self,
        task: &TaskRecord,
        history: &[Turn],
        completion: &str,
    ) -> anyhow::Result<TurnFeedback> {
        match self {
            MockEnv::Hash(env) => env.respond(task, history, completion).await,
            MockEnv::Succeed(env) => env.respond(task, history, completion).await,
        }
    }
}

fn create_env(choice: &EnvChoice) -> MockEnv {
    match choice {
        EnvChoice::Hash => {
            tracing::info!("Using hash-scored mock environment");
            MockEnv::Hash(HashScoredEnv::new(2))
        }
        EnvChoice::Succeed => {
            tracing::info!("Using succeed-after mock environment");
            MockEnv::Succeed(ScriptedEnv::succeed_after(2))
        }
    }
}
