//! Policy training: batches in, weight versions out.
//!
//! - [`backend`]: the training-framework seam and the deterministic
//!   in-memory implementation.
//! - [`trainer`]: [`trainer::PolicyTrainer`], which owns the step counter
//!   and trainer state.

pub mod backend;
pub mod trainer;

// Re-export the most commonly used items at the module level.
pub use backend::{BackendState, BackwardMetrics, InMemoryBackend, TrainingBackend};
pub use trainer::{PolicyTrainer, TrainReport, TrainerState};
