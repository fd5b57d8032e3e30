//! Meshlink Gateway - provisioning and command routing for a BLE mesh fleet
//!
//! This library provides the application layer on top of a mesh transport:
//! - Provisioning: enrollment, capability discovery, key install and binding
//! - Command routing with one unicast exchange in flight at a time
//! - Periodic monitoring of one node
//! - Reply bridging to a low-payload side channel
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Companion app (side channel)              │
//! │        commands in       │      frames out           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Meshlink Gateway                     │
//! │  Router │ Serializer │ Monitor │ Bridge │ Provisioner│
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Mesh transport service                  │
//! │  Enrollment │ Keys │ Config client │ Unicast/Group   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod mesh;
pub mod nodes;
pub mod provisioning;
pub mod router;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use mesh::{Address, MeshEvent, MeshTransport};
pub use nodes::{NodeRecord, NodeRegistry, NodeTracker};
pub use provisioning::{BindOrchestrator, CompositionParser, ProvisioningOrchestrator};
pub use router::{CommandRouter, LocalExecutor, MonitorPoller, SendSerializer};
pub use bridge::{Notifier, ResponseBridge};
