//! Provisioner side: enrollment, capability discovery and binding

pub mod binding;
pub mod composition;
pub mod keys;
pub mod orchestrator;

pub use binding::{BIND_SEQUENCE, BindOrchestrator, BindStep, Progress};
pub use composition::{Composition, CompositionParser};
pub use keys::{KEYS_STATE_KEY, ProvisionerKeys};
pub use orchestrator::{NODES_STATE_KEY, ProvisioningOrchestrator};
