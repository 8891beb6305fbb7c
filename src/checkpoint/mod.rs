//! Trainer state persistence and resume.

pub mod manager;

// Re-export the most commonly used items at the module level.
pub use manager::{CheckpointManager, CheckpointMetadata, CheckpointRecord};
