//! Trajectory generation: tasks in, terminal trajectories out.
//!
//! - [`trajectory`]: turn/trajectory/group data model, termination reasons,
//!   and the shared step budget.
//! - [`env`]: the environment collaborator trait, task records, and the
//!   scripted environments used by mock runs and tests.
//! - [`orchestrator`]: the rollout driver with batched and async dispatch.
//! - [`store`]: optional per-step JSON dumps.

pub mod env;
pub mod orchestrator;
pub mod store;
pub mod trajectory;

// Re-export the most commonly used items at the module level.
pub use env::{
    Environment, HashScoredEnv, PromptSet, ScriptedEnv, SucceedAfterEnv, TaskRecord, TurnFeedback,
};
pub use orchestrator::{RolloutOptions, RolloutOrchestrator, RolloutOutcome};
pub use store::{BatchDump, TrajectoryStore};
pub use trajectory::{
    StepBudget, TerminationReason, TrainingBatch, Trajectory, TrajectoryGroup, TrajectoryState,
    Turn,
};
