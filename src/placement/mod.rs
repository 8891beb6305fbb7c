//! Device placement planning for trainer and engine processes.
//!
//! This module provides:
//! - [`plan::Role`], [`plan::DeviceId`] -- the role/device vocabulary used
//!   across the crate.
//! - [`plan::PlacementPlan`] -- the immutable role-to-device-set map built
//!   once at startup, with fail-fast validation of the GPU budget and of
//!   colocation shape requirements.

pub mod plan;

// Re-export the most commonly used items at the module level.
pub use plan::{DeviceId, PlacementPlan, Role};
