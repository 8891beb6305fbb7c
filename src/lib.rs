//! Baleen: orchestration core for RL post-training of LLM policies
//!
//! Coordinates the three players of an online RL loop -- a sharded trainer,
//! a pool of inference engines, and an environment -- through device
//! placement, versioned weight synchronization, multi-turn rollout
//! scheduling, and checkpoint/resume.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod placement;
pub mod rollout;
pub mod run;
pub mod sync;
pub mod trainer;
