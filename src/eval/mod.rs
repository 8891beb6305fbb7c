//! Held-out evaluation scheduling and reporting.

pub mod scheduler;

// Re-export the most commonly used items at the module level.
pub use scheduler::{EvalReport, EvalScheduler, TaskEvalSummary};
