//! Gateway command routing
//!
//! Turns addressed text commands into mesh sends and mesh events into
//! notifier reports:
//!
//! ```text
//!   command ──▶ parse ──▶ monitor? ──▶ local? ──▶ vendor path ──▶ group / serialized unicast
//!                                                  │
//!                                                  └─ not bound ─▶ on/off fallback
//!
//!   mesh event ──▶ self-echo guard ──▶ serializer / monitor / tracker ──▶ bridge
//! ```

pub mod command;
pub mod monitor;
pub mod serializer;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::bridge::ResponseBridge;
use crate::config::Config;
use crate::db::{StateStore, restore_json, save_json};
use crate::mesh::{Address, Capability, MeshEvent, MeshTransport, ModelId, Opcode, OutboundMessage};
use crate::nodes::NodeTracker;

pub use command::{Action, Command, ParseError, Target};
pub use monitor::{MonitorPoller, MonitorState};
pub use serializer::{PendingSend, SendSerializer};

/// Store key of the gateway's own link state
pub const GATEWAY_STATE_KEY: &str = "gateway";

/// Runs a command on this device's own load
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Execute a wire verb (`r`, `s`, `duty:N`, `read`) and return the reading
    async fn execute(&self, command: &str) -> String;
}

/// The gateway's own mesh link state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayState {
    pub net_index: u16,
    /// Application key index, once one is installed
    pub app_index: Option<u16>,
    pub own_address: Address,
    /// Whether the vendor client is bound, enabling text commands
    pub vendor_bound: bool,
}

/// How a command was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Executed on this device
    Local,
    /// Sent to one node through the serializer
    Unicast(Address),
    /// Executed locally and sent to the group
    Group(Address),
    /// Sent as on/off to these nodes
    Fallback(Vec<Address>),
    /// Monitor armed on this node
    MonitorArmed(Address),
    /// Refused with this reply
    Rejected(String),
    /// The transport refused the send
    Failed,
}

#[derive(Debug, Clone)]
struct Settings {
    node_base: Address,
    group: Address,
    max_nodes: usize,
    max_command_len: usize,
    disarm_wait: Duration,
    fallback_pause: Duration,
    vendor_timeout: Duration,
    onoff_timeout: Duration,
}

/// Routes commands to the mesh and mesh replies to the notifier
pub struct CommandRouter {
    settings: Settings,
    transport: Arc<dyn MeshTransport>,
    serializer: Arc<SendSerializer>,
    monitor: MonitorPoller,
    tracker: Mutex<NodeTracker>,
    state: Mutex<GatewayState>,
    bridge: ResponseBridge,
    executor: Arc<dyn LocalExecutor>,
    store: Arc<dyn StateStore>,
    tid: AtomicU8,
}

impl CommandRouter {
    /// Create a router, restoring link state saved by a previous run
    ///
    /// # Errors
    ///
    /// Returns error if the saved state cannot be read
    pub fn new(
        config: &Config,
        transport: Arc<dyn MeshTransport>,
        bridge: ResponseBridge,
        executor: Arc<dyn LocalExecutor>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let mut state: GatewayState = restore_json(store.as_ref(), GATEWAY_STATE_KEY)?.unwrap_or_default();
        if state.app_index.is_some() && !state.vendor_bound {
            state.vendor_bound = true;
        }
        if state.vendor_bound {
            tracing::info!(address = %state.own_address, "restored bound link state");
        }

        let serializer = Arc::new(SendSerializer::new(
            Arc::clone(&transport),
            config.timing.send_ceiling,
            config.timing.send_recheck,
        ));
        let monitor = MonitorPoller::new(
            Arc::clone(&serializer),
            bridge.clone(),
            config.timing.monitor_interval,
            config.timing.vendor_timeout,
        );

        Ok(Self {
            settings: Settings {
                node_base: config.mesh.node_base_address,
                group: config.mesh.group_address,
                max_nodes: config.mesh.max_nodes,
                max_command_len: config.bridge.max_command_len,
                disarm_wait: config.timing.disarm_wait,
                fallback_pause: config.timing.fallback_pause,
                vendor_timeout: config.timing.vendor_timeout,
                onoff_timeout: config.timing.onoff_timeout,
            },
            transport,
            serializer,
            monitor,
            tracker: Mutex::new(NodeTracker::new(state.own_address, config.mesh.max_nodes)),
            state: Mutex::new(state),
            bridge,
            executor,
            store,
            tid: AtomicU8::new(0),
        })
    }

    /// Parse and dispatch one command, reporting the outcome to the notifier
    pub async fn handle_command(&self, input: &str) -> Dispatch {
        let command = match command::parse(input, self.settings.max_command_len, self.settings.max_nodes) {
            Ok(command) => command,
            Err(e) => {
                let reply = e.to_string();
                tracing::debug!(input, %reply, "command refused");
                self.bridge.status(&reply).await;
                return Dispatch::Rejected(reply);
            }
        };
        tracing::debug!(?command, "command");

        if command.action != Action::Monitor && self.monitor.is_armed() {
            self.disarm_monitor().await;
        }

        let Some(wire) = command.action.wire() else {
            return self.arm_monitor(command.target).await;
        };

        let (own_address, vendor_bound) = {
            let state = self.state();
            (state.own_address, state.vendor_bound)
        };

        let unicast = command.target.address(self.settings.node_base);
        if unicast == Some(own_address) {
            self.run_local(own_address, &wire).await;
            return Dispatch::Local;
        }

        if !vendor_bound {
            return self.send_fallback(&command).await;
        }

        match unicast {
            None => {
                self.run_local(own_address, &wire).await;
                let group = self.settings.group;
                if let Err(e) = self.serializer.send(self.vendor_message(group, &wire)).await {
                    tracing::warn!(%group, error = %e, "group send failed");
                    self.bridge.status("ERROR:MESH_SEND_FAIL").await;
                    return Dispatch::Failed;
                }
                self.bridge.status(&format!("SENT:{}", command.keyword)).await;
                Dispatch::Group(group)
            }
            Some(target) => {
                if let Err(e) = self.serializer.send(self.vendor_message(target, &wire)).await {
                    tracing::warn!(%target, error = %e, "vendor send failed");
                    self.bridge.status("ERROR:MESH_SEND_FAIL").await;
                    return Dispatch::Failed;
                }
                self.bridge.status(&format!("SENT:{}", command.keyword)).await;
                Dispatch::Unicast(target)
            }
        }
    }

    /// Apply one event from the mesh transport
    pub async fn handle_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::Provisioned { address, net_index } => {
                {
                    let mut state = self.state();
                    state.own_address = address;
                    state.net_index = net_index;
                }
                self.tracker().set_own_address(address);
                tracing::info!(%address, net_index, "gateway provisioned");
                self.persist();
            }
            MeshEvent::AppKeyAdded { net_index, app_index } => {
                {
                    let mut state = self.state();
                    state.net_index = net_index;
                    state.app_index = Some(app_index);
                }
                tracing::info!(net_index, app_index, "application key added");
                self.persist();
            }
            MeshEvent::ModelBound { model, app_index } => self.on_model_bound(model, app_index).await,
            MeshEvent::Reply {
                source,
                opcode,
                payload,
                in_reply_to,
            } => self.on_reply(source, opcode, &payload, in_reply_to).await,
            MeshEvent::SendFailed { target, reason } => {
                tracing::warn!(%target, %reason, "mesh send failed");
                self.serializer.on_send_failed(target);
                self.monitor.settle(target);
                self.bridge.status("ERROR:MESH_SEND_FAIL").await;
            }
            MeshEvent::Timeout { target, opcode } => self.on_timeout(target, opcode).await,
            other => tracing::trace!(event = ?other, "event not handled by gateway"),
        }
    }

    /// Snapshot of the link state
    #[must_use]
    pub fn gateway_state(&self) -> GatewayState {
        self.state().clone()
    }

    /// Addresses learned from replies
    #[must_use]
    pub fn known_nodes(&self) -> Vec<Address> {
        self.tracker().known().to_vec()
    }

    #[must_use]
    pub fn is_discovery_complete(&self) -> bool {
        self.tracker().is_discovery_complete()
    }

    #[must_use]
    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    #[must_use]
    pub fn pending_send(&self) -> PendingSend {
        self.serializer.state()
    }

    async fn on_model_bound(&self, model: ModelId, app_index: u16) {
        let vendor = Capability::from_model(model) == Some(Capability::VendorClient);
        {
            let mut state = self.state();
            state.app_index = Some(app_index);
            if vendor {
                state.vendor_bound = true;
            }
        }
        self.persist();

        if vendor {
            tracing::info!(app_index, "vendor client bound, text commands enabled");
            self.bridge.status("MESH_READY:VENDOR").await;
        } else {
            tracing::info!(?model, app_index, "model bound");
            self.bridge.status("MESH_READY").await;
        }
    }

    async fn on_reply(&self, source: Address, opcode: Opcode, payload: &[u8], in_reply_to: Opcode) {
        if source == self.state().own_address {
            tracing::trace!(%source, "ignoring own echo");
            return;
        }

        if opcode == Opcode::VendorStatus {
            self.serializer.on_reply(source);
            self.monitor.settle(source);
            self.tracker().learn(source);
        }
        self.bridge.forward_reply(source, opcode, payload, in_reply_to).await;
    }

    async fn on_timeout(&self, target: Address, opcode: Opcode) {
        match opcode {
            Opcode::OnOffGet | Opcode::OnOffSet => {
                tracing::debug!(%target, "on/off request timed out");
                self.bridge.report_timeout(target).await;
            }
            Opcode::VendorSend => {
                if !self.serializer.on_timeout(target) {
                    tracing::debug!(%target, "timeout with nothing in flight, ignoring");
                    return;
                }

                {
                    let mut tracker = self.tracker();
                    let known = u16::try_from(tracker.len()).unwrap_or(u16::MAX);
                    if target.0 > self.settings.node_base.0.saturating_add(known) {
                        tracker.mark_discovery_complete();
                    }
                }

                self.monitor.settle(target);
                if self.monitor.is_armed() {
                    tracing::debug!(%target, "monitor poll timed out");
                } else {
                    tracing::warn!(%target, "vendor send timed out");
                    self.bridge.status("ERROR:MESH_TIMEOUT").await;
                }
            }
            Opcode::VendorStatus | Opcode::OnOffStatus => {}
        }
    }

    async fn arm_monitor(&self, target: Target) -> Dispatch {
        if !self.state().vendor_bound {
            self.bridge.status("ERROR:NOT_READY").await;
            return Dispatch::Rejected("ERROR:NOT_READY".to_string());
        }

        let address = match target {
            Target::All => self
                .tracker()
                .first()
                .unwrap_or_else(|| self.settings.node_base.offset(1)),
            Target::Index(i) => self.settings.node_base.offset(i),
        };
        self.monitor.arm(address);
        self.bridge.status("SENT:MONITOR").await;
        Dispatch::MonitorArmed(address)
    }

    async fn disarm_monitor(&self) {
        self.monitor.disarm();
        if !self.serializer.wait_idle(self.settings.disarm_wait).await {
            tracing::debug!("last monitor poll unanswered, clearing");
        }
        self.serializer.force_clear();
    }

    async fn run_local(&self, own_address: Address, wire: &str) {
        let reply = self.executor.execute(wire).await;
        tracing::debug!(command = wire, %reply, "executed locally");
        self.bridge.report_local(own_address, &reply).await;
    }

    async fn send_fallback(&self, command: &Command) -> Dispatch {
        if self.state().app_index.is_none() {
            tracing::warn!("no application key yet, cannot send");
            self.bridge.status("ERROR:NOT_READY").await;
            return Dispatch::Rejected("ERROR:NOT_READY".to_string());
        }

        let value = command.action.onoff_value();
        let targets = match command.target.address(self.settings.node_base) {
            Some(address) => vec![address],
            None => {
                let known = self.known_nodes();
                if known.is_empty() {
                    vec![self.settings.node_base.offset(1)]
                } else {
                    known
                }
            }
        };

        let mut refused = 0;
        for (i, &target) in targets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.fallback_pause).await;
            }
            let message = OutboundMessage {
                dst: target,
                opcode: Opcode::OnOffSet,
                payload: vec![value, self.tid.fetch_add(1, Ordering::Relaxed)],
                timeout: self.settings.onoff_timeout,
            };
            if let Err(e) = self.transport.send(message).await {
                tracing::warn!(%target, error = %e, "on/off send failed");
                self.bridge.status("ERROR:MESH_SEND_FAIL").await;
                refused += 1;
            }
        }

        if refused == targets.len() {
            return Dispatch::Failed;
        }

        let reply = if value == 0 {
            "SENT:OFF(fallback)"
        } else {
            "SENT:ON(fallback)"
        };
        self.bridge.status(reply).await;
        Dispatch::Fallback(targets)
    }

    fn vendor_message(&self, dst: Address, wire: &str) -> OutboundMessage {
        OutboundMessage {
            dst,
            opcode: Opcode::VendorSend,
            payload: wire.as_bytes().to_vec(),
            timeout: self.settings.vendor_timeout,
        }
    }

    fn persist(&self) {
        let state = self.gateway_state();
        if let Err(e) = save_json(self.store.as_ref(), GATEWAY_STATE_KEY, &state) {
            tracing::warn!(error = %e, "failed to save gateway state");
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, NodeTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
