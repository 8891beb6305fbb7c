use serde::{Deserialize, Serialize};

/// Complete configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub placement: PlacementConfig,
    pub engine: EngineConfig,
    pub rollout: RolloutConfig,
    pub trainer: TrainerConfig,
    pub sync: SyncConfig,
    pub checkpoint: CheckpointConfig,
    pub eval: EvalConfig,
}

/// Device placement across the cluster.
///
/// Role shapes are validated when the placement plan is built: either every
/// role fits in a disjoint slice of the budget, or `colocate_all` stacks all
/// roles onto the identical device set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Number of nodes in the cluster (default: 1).
    pub nodes: u32,
    /// GPUs available per node (default: 8).
    pub gpus_per_node: u32,
    /// Nodes holding the sharded policy model (default: 1).
    pub policy_nodes: u32,
    /// GPUs per node for the policy shards (default: 4).
    pub policy_gpus_per_node: u32,
    /// Nodes holding the frozen reference model (default: 1).
    pub reference_nodes: u32,
    /// GPUs per node for the reference shards (default: 2).
    pub reference_gpus_per_node: u32,
    /// Number of inference engine replicas (default: 2).
    pub num_engines: usize,
    /// Tensor-parallel degree of each engine replica (default: 1).
    pub engine_tp_size: usize,
    /// Stack every role onto the same devices and alternate phases
    /// instead of carving up the budget (default: false).
    pub colocate_all: bool,
}

/// Inference engine pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Serve single requests as they arrive instead of one blocking
    /// batch call per round. Required when `rollout.batched` is false
    /// (default: false).
    pub async_engine: bool,
    /// Timeout for one generation call, in seconds (default: 120).
    pub generate_timeout_secs: u64,
    /// Remote engine endpoints. Empty means in-process engines, one per
    /// `placement.num_engines` replica.
    pub remote_urls: Vec<String>,
    /// Sampling parameters used for training rollouts.
    pub sampling: SamplingConfig,
}

/// Token sampling parameters forwarded to the engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling temperature (default: 1.0).
    pub temperature: f64,
    /// Nucleus sampling cutoff (default: 1.0).
    pub top_p: f64,
    /// Maximum tokens generated per turn (default: 512).
    pub max_generate_tokens: usize,
}

/// Rollout generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Prompts drawn from the dataset per training batch (default: 8).
    pub prompts_per_batch: usize,
    /// Trajectories sampled per prompt; groups are never split across
    /// batches (default: 4).
    pub n_samples_per_prompt: usize,
    /// Per-trajectory turn cap (default: 4).
    pub max_turns: usize,
    /// Shared turn budget across the whole batch; `null` disables it.
    pub step_limit: Option<usize>,
    /// Group all ready trajectories into one engine call per round, rather
    /// than dispatching each trajectory independently (default: true).
    pub batched: bool,
    /// Directory for per-step trajectory dumps; `null` disables dumping.
    pub dump_dir: Option<String>,
}

/// Trainer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Learning rate of the in-memory backend (default: 1e-5).
    pub learning_rate: f64,
    /// Total optimizer steps to run (default: 100).
    pub total_steps: u64,
    /// Base RNG seed; engines and per-step streams derive from it
    /// (default: 42).
    pub seed: u64,
    /// Flat parameter count of the in-memory backend (default: 256).
    pub param_count: usize,
}

/// Weight synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Transport used to move weight snapshots to the engines.
    pub transport: SyncTransportKind,
    /// Per-engine acknowledgement timeout, in seconds (default: 30).
    pub ack_timeout_secs: u64,
}

/// How weight snapshots travel from trainer to engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTransportKind {
    /// Share the snapshot in memory. The natural choice when trainer and
    /// engines are colocated or adjacent.
    Collective,
    /// Encode the snapshot once and ship bytes. Required for engines that
    /// are topologically separate (e.g. behind HTTP).
    Serialized,
}

/// Checkpoint cadence and layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root directory; one subdirectory is written per checkpointed step.
    pub dir: String,
    /// Save every N optimizer steps; 0 disables checkpointing (default: 10).
    pub interval: u64,
    /// Keep only the most recent N records; `null` keeps everything.
    pub keep_last: Option<usize>,
    /// Refuse to start when there is nothing to resume from, instead of
    /// falling back to a cold start (default: false).
    #[serde(default)]
    pub require_resume: bool,
}

/// Evaluation cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Evaluate every N optimizer steps; 0 disables eval (default: 25).
    pub interval: u64,
    /// Run one evaluation before the first training step (default: false).
    pub before_training: bool,
    /// Held-out prompts evaluated per run (default: 16).
    pub prompts_per_eval: usize,
    /// Sampling temperature during eval (default: 0.0).
    pub temperature: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            placement: PlacementConfig {
                nodes: 1,
                gpus_per_node: 8,
                policy_nodes: 1,
                policy_gpus_per_node: 4,
                reference_nodes: 1,
                reference_gpus_per_node: 2,
                num_engines: 2,
                engine_tp_size: 1,
                colocate_all: false,
            },
            engine: EngineConfig {
                async_engine: false,
                generate_timeout_secs: 120,
                remote_urls: Vec::new(),
                sampling: SamplingConfig {
                    temperature: 1.0,
                    top_p: 1.0,
                    max_generate_tokens: 512,
                },
            },
            rollout: RolloutConfig {
                prompts_per_batch: 8,
                n_samples_per_prompt: 4,
                max_turns: 4,
                step_limit: None,
                batched: true,
                dump_dir: None,
            },
            trainer: TrainerConfig {
                learning_rate: 1e-5,
                total_steps: 100,
                seed: 42,
                param_count: 256,
            },
            sync: SyncConfig {
                transport: SyncTransportKind::Collective,
                ack_timeout_secs: 30,
            },
            checkpoint: CheckpointConfig {
                dir: "data/checkpoints".into(),
                interval: 10,
                keep_last: Some(3),
                require_resume: false,
            },
            eval: EvalConfig {
                interval: 25,
                before_training: false,
                prompts_per_eval: 16,
                temperature: 0.0,
            },
        }
    }
}
