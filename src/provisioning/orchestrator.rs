//! Provisioning workflow driven by transport completion events
//!
//! One device is enrolled at a time. Each completion event moves its record
//! one phase further: enrolled, capabilities parsed, key installed, each bind
//! and subscribe answered, fully configured.

use std::sync::Arc;

use crate::Result;
use crate::config::Config;
use crate::db::{StateStore, restore_json, save_json};
use crate::mesh::{Address, ConfigOutcome, ConfigRequest, DeviceId, MeshEvent, MeshTransport};
use crate::nodes::{CapabilitySet, NodeRecord, NodeRegistry, PhaseTrigger, ProvisioningPhase};

use super::binding::{BindOrchestrator, BindStep, Progress};
use super::composition::CompositionParser;
use super::keys::{KEYS_STATE_KEY, ProvisionerKeys};

/// Store key the node registry is saved under
pub const NODES_STATE_KEY: &str = "nodes";

/// Provisioner-side owner of the registry and the enrollment workflow
///
/// Events must be fed in arrival order from a single task.
pub struct ProvisioningOrchestrator {
    transport: Arc<dyn MeshTransport>,
    store: Arc<dyn StateStore>,
    registry: NodeRegistry,
    binder: BindOrchestrator,
    keys: ProvisionerKeys,
    keys_ready: bool,
    enrolling: Option<DeviceId>,
    filter_prefix: Vec<u8>,
    config_retries: u8,
}

impl ProvisioningOrchestrator {
    /// Create the orchestrator, restoring keys and registry from `store`
    ///
    /// # Errors
    ///
    /// Returns error if saved state cannot be read or new keys cannot be saved
    pub fn new(config: &Config, transport: Arc<dyn MeshTransport>, store: Arc<dyn StateStore>) -> Result<Self> {
        let keys = ProvisionerKeys::load_or_generate(
            store.as_ref(),
            config.mesh.net_key_index,
            config.mesh.app_key_index,
        )?;
        let records: Vec<NodeRecord> = restore_json(store.as_ref(), NODES_STATE_KEY)?.unwrap_or_default();
        if !records.is_empty() {
            tracing::info!(nodes = records.len(), "restored node registry");
        }

        Ok(Self {
            transport,
            store,
            registry: NodeRegistry::from_records(config.mesh.max_nodes, records),
            binder: BindOrchestrator::new(
                keys.app_index,
                config.mesh.group_address,
                config.mesh.bind_timeout_retries,
            ),
            keys,
            keys_ready: false,
            enrolling: None,
            filter_prefix: config.mesh.uuid_prefix.clone(),
            config_retries: config.mesh.bind_timeout_retries,
        })
    }

    /// Install the local keys; scanning starts once they are ready
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the keys
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            fingerprint = %self.keys.fingerprint(),
            prefix = %hex::encode(&self.filter_prefix),
            "provisioner starting"
        );
        self.transport.install_local_keys(&self.keys.app_key()).await
    }

    /// Apply one transport event
    pub async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::LocalKeysReady { net_index, app_index } => {
                self.on_keys_ready(net_index, app_index).await;
            }
            MeshEvent::DeviceDiscovered { device_id } => self.on_discovered(device_id).await,
            MeshEvent::EnrollmentComplete {
                device_id,
                node_index,
                address,
                element_count,
            } => {
                self.on_enrolled(device_id, node_index, address, element_count)
                    .await;
            }
            MeshEvent::EnrollmentClosed { device_id, reason } => {
                self.on_enrollment_closed(device_id, reason).await;
            }
            MeshEvent::CompositionReceived { address, data } => {
                self.on_composition(address, &data).await;
            }
            MeshEvent::ConfigStatus {
                address,
                request,
                outcome,
            } => self.on_config_status(address, request, outcome).await,
            other => tracing::trace!(event = ?other, "event not handled by provisioner"),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn keys(&self) -> &ProvisionerKeys {
        &self.keys
    }

    #[must_use]
    pub const fn is_keys_ready(&self) -> bool {
        self.keys_ready
    }

    /// Device whose enrollment is in progress
    #[must_use]
    pub const fn enrolling(&self) -> Option<DeviceId> {
        self.enrolling
    }

    async fn on_keys_ready(&mut self, net_index: u16, app_index: u16) {
        self.keys.assign_indices(net_index, app_index);
        self.binder.set_app_index(app_index);
        self.keys_ready = true;
        if let Err(e) = save_json(self.store.as_ref(), KEYS_STATE_KEY, &self.keys) {
            tracing::warn!(error = %e, "failed to save provisioner keys");
        }
        tracing::info!(net_index, app_index, "local keys ready");
        self.scan().await;
    }

    async fn on_discovered(&mut self, device_id: DeviceId) {
        if !self.keys_ready {
            tracing::debug!(device = %device_id, "keys not ready, ignoring advertisement");
            return;
        }
        if let Some(current) = self.enrolling {
            tracing::debug!(device = %device_id, %current, "enrollment in progress, ignoring advertisement");
            return;
        }
        if !device_id.matches_prefix(&self.filter_prefix) {
            tracing::debug!(device = %device_id, "device does not match filter");
            return;
        }
        if self.registry.is_full() && !self.registry.contains(&device_id) {
            tracing::warn!(
                device = %device_id,
                capacity = self.registry.capacity(),
                "registry full, not enrolling"
            );
            return;
        }

        tracing::info!(device = %device_id, "enrolling device");
        self.enrolling = Some(device_id);
        if let Err(e) = self.transport.provision(device_id).await {
            tracing::warn!(device = %device_id, error = %e, "enrollment not started");
            self.enrolling = None;
        }
    }

    async fn on_enrolled(&mut self, device_id: DeviceId, node_index: u16, address: Address, element_count: u8) {
        if self.enrolling == Some(device_id) {
            self.enrolling = None;
        }

        let record = match self
            .registry
            .upsert(device_id, node_index, address, element_count)
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(device = %device_id, %address, error = %e, "cannot track enrolled device");
                return;
            }
        };
        record.advance_phase(PhaseTrigger::Enrolled);
        record.step_timeouts = 0;
        tracing::info!(
            device = %device_id,
            %address,
            elements = element_count,
            name = %record.display_name,
            "device enrolled"
        );
        self.persist();
        self.request_capabilities(address).await;
    }

    async fn on_enrollment_closed(&mut self, device_id: DeviceId, reason: u8) {
        if self.enrolling == Some(device_id) {
            self.enrolling = None;
            if reason != 0 {
                tracing::warn!(device = %device_id, reason, "enrollment failed");
            }
        }
        self.scan().await;
    }

    async fn on_composition(&mut self, address: Address, data: &[u8]) {
        let Some(record) = self.registry.find_by_address_mut(address) else {
            tracing::debug!(%address, "capabilities from unknown node");
            return;
        };
        if record.phase != ProvisioningPhase::AwaitingCapabilities {
            tracing::debug!(%address, phase = ?record.phase, "duplicate capability advertisement");
            return;
        }

        let capabilities = match CompositionParser::parse(data) {
            Ok(composition) => {
                if composition.truncated {
                    tracing::warn!(%address, len = data.len(), "capability advertisement truncated");
                }
                composition.capabilities
            }
            Err(e) => {
                tracing::warn!(%address, error = %e, "unreadable capability advertisement");
                CapabilitySet::new()
            }
        };

        record.apply_capabilities(capabilities);
        record.advance_phase(PhaseTrigger::CapabilitiesReceived);
        tracing::info!(
            %address,
            capabilities = ?capabilities.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "capabilities received"
        );
        self.persist();
        self.install_key(address).await;
    }

    async fn on_config_status(&mut self, address: Address, request: ConfigRequest, outcome: ConfigOutcome) {
        let Some(record) = self.registry.find_by_address_mut(address) else {
            tracing::debug!(%address, ?request, "config status from unknown node");
            return;
        };

        match request {
            ConfigRequest::CompositionGet => {
                if record.phase != ProvisioningPhase::AwaitingCapabilities
                    || outcome != ConfigOutcome::TimedOut
                {
                    return;
                }
                record.step_timeouts = record.step_timeouts.saturating_add(1);
                if record.step_timeouts > self.config_retries {
                    tracing::error!(%address, "node never sent its capabilities");
                    return;
                }
                self.request_capabilities(address).await;
            }
            ConfigRequest::AppKeyAdd => {
                if record.phase != ProvisioningPhase::KeyInstalling {
                    return;
                }
                match outcome {
                    ConfigOutcome::Acknowledged => {
                        tracing::debug!(%address, "application key installed");
                    }
                    ConfigOutcome::Rejected(status) => {
                        tracing::warn!(%address, status, "application key rejected, binding anyway");
                    }
                    ConfigOutcome::TimedOut => {
                        record.step_timeouts = record.step_timeouts.saturating_add(1);
                        if record.step_timeouts <= self.config_retries {
                            self.install_key(address).await;
                            return;
                        }
                        tracing::warn!(%address, "application key never acknowledged, binding anyway");
                    }
                }
                record.step_timeouts = 0;
                self.bind_next(address).await;
            }
            ConfigRequest::ModelAppBind(_) | ConfigRequest::ModelSubscribe(_) => {
                let Some(step) = BindStep::from_request(request) else {
                    return;
                };
                if record.phase != ProvisioningPhase::Binding(step) {
                    tracing::debug!(%address, ?step, phase = ?record.phase, "stale bind status");
                    return;
                }
                self.binder.apply_outcome(record, step, outcome);
                self.bind_next(address).await;
            }
        }
    }

    async fn bind_next(&mut self, address: Address) {
        let Some(record) = self.registry.find_by_address_mut(address) else {
            return;
        };
        if let Progress::Configured = self.binder.advance(record, self.transport.as_ref()).await {
            tracing::debug!(%address, degraded = record.is_degraded(), "binding finished");
        }
        self.persist();
    }

    async fn request_capabilities(&self, address: Address) {
        if let Err(e) = self.transport.request_capabilities(address).await {
            tracing::warn!(%address, error = %e, "capability request not sent");
        }
    }

    async fn install_key(&mut self, address: Address) {
        let key = self.keys.app_key();
        loop {
            let Err(e) = self.transport.install_key(address, &key).await else {
                return;
            };
            tracing::warn!(%address, error = %e, "key install not sent");

            let Some(record) = self.registry.find_by_address_mut(address) else {
                return;
            };
            record.step_timeouts = record.step_timeouts.saturating_add(1);
            if record.step_timeouts > self.config_retries {
                record.step_timeouts = 0;
                self.bind_next(address).await;
                return;
            }
        }
    }

    async fn scan(&self) {
        if let Err(e) = self.transport.enroll(&self.filter_prefix).await {
            tracing::warn!(error = %e, "scan not started");
        }
    }

    fn persist(&self) {
        if let Err(e) = save_json(self.store.as_ref(), NODES_STATE_KEY, self.registry.records()) {
            tracing::warn!(error = %e, "failed to save node registry");
        }
    }
}
