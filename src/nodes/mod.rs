//! Node bookkeeping
//!
//! The provisioner keeps a [`NodeRegistry`] of enrolled devices and their
//! binding progress; the gateway keeps a [`NodeTracker`] of nodes it has heard
//! from.

pub mod registry;
pub mod tracker;
pub mod types;

pub use registry::NodeRegistry;
pub use tracker::NodeTracker;
pub use types::{
    CapabilitySet, GroupState, ModelState, NodeRecord, PhaseTrigger, ProvisioningPhase,
    StepResolution,
};
