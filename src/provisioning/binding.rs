//! Capability binding sequence
//!
//! Steps run in a fixed order from [`BIND_SEQUENCE`]; adding a capability is
//! a table entry. A step is skipped when its capability was not advertised.

use serde::{Deserialize, Serialize};

use crate::mesh::{Address, Capability, ConfigOutcome, ConfigRequest, MeshTransport};
use crate::nodes::{NodeRecord, PhaseTrigger, ProvisioningPhase, StepResolution};
use crate::Result;

/// One configuration step after the application key is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindStep {
    /// Bind the capability's model to the application key
    Bind(Capability),
    /// Subscribe the capability's model to the group address
    Subscribe(Capability),
}

/// Steps in priority order
pub const BIND_SEQUENCE: [BindStep; 5] = [
    BindStep::Bind(Capability::ActuatorServer),
    BindStep::Bind(Capability::ActuatorClient),
    BindStep::Bind(Capability::VendorServer),
    BindStep::Bind(Capability::VendorClient),
    BindStep::Subscribe(Capability::VendorServer),
];

impl BindStep {
    #[must_use]
    pub const fn capability(self) -> Capability {
        match self {
            Self::Bind(cap) | Self::Subscribe(cap) => cap,
        }
    }

    /// Configuration request this step issues
    #[must_use]
    pub const fn request(self) -> ConfigRequest {
        match self {
            Self::Bind(cap) => ConfigRequest::ModelAppBind(cap),
            Self::Subscribe(cap) => ConfigRequest::ModelSubscribe(cap),
        }
    }

    /// Step a configuration status answers, if any
    #[must_use]
    pub const fn from_request(request: ConfigRequest) -> Option<Self> {
        match request {
            ConfigRequest::ModelAppBind(cap) => Some(Self::Bind(cap)),
            ConfigRequest::ModelSubscribe(cap) => Some(Self::Subscribe(cap)),
            ConfigRequest::CompositionGet | ConfigRequest::AppKeyAdd => None,
        }
    }
}

/// What the orchestrator did after evaluating a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A request for this step is in flight
    Issued(BindStep),
    /// Nothing left to do
    Configured,
}

/// Drives a node through [`BIND_SEQUENCE`]
#[derive(Debug, Clone)]
pub struct BindOrchestrator {
    app_index: u16,
    group: Address,
    timeout_retries: u8,
}

impl BindOrchestrator {
    /// `timeout_retries` is how many times a timed-out step is re-issued
    /// before it is given up
    #[must_use]
    pub const fn new(app_index: u16, group: Address, timeout_retries: u8) -> Self {
        Self {
            app_index,
            group,
            timeout_retries,
        }
    }

    pub const fn set_app_index(&mut self, app_index: u16) {
        self.app_index = app_index;
    }

    /// First step in priority order that still has work to do
    #[must_use]
    pub fn next_step(record: &NodeRecord) -> Option<BindStep> {
        BIND_SEQUENCE
            .into_iter()
            .find(|step| record.step_pending(*step))
    }

    /// Issue the next pending step, or mark the node fully configured
    ///
    /// A request that cannot be issued is treated like a transport timeout.
    pub async fn advance(&self, record: &mut NodeRecord, transport: &dyn MeshTransport) -> Progress {
        while let Some(step) = Self::next_step(record) {
            match self.issue(step, record.address, transport).await {
                Ok(()) => {
                    tracing::debug!(address = %record.address, ?step, "bind step issued");
                    record.advance_phase(PhaseTrigger::StepIssued(step));
                    return Progress::Issued(step);
                }
                Err(e) => {
                    tracing::warn!(address = %record.address, ?step, error = %e, "bind step not sent");
                    self.record_timeout(record, step);
                }
            }
        }

        if record.phase != ProvisioningPhase::FullyConfigured
            && record.advance_phase(PhaseTrigger::Configured)
        {
            tracing::info!(
                address = %record.address,
                name = %record.display_name,
                degraded = record.is_degraded(),
                "node fully configured"
            );
        }
        Progress::Configured
    }

    /// Apply the outcome of a bind or subscribe request
    ///
    /// A rejection ends the step. A timeout leaves the step pending until the
    /// retry budget is spent.
    pub fn apply_outcome(&self, record: &mut NodeRecord, step: BindStep, outcome: ConfigOutcome) {
        let result = match outcome {
            ConfigOutcome::Acknowledged => record.resolve(step, StepResolution::Done),
            ConfigOutcome::Rejected(status) => {
                tracing::warn!(
                    address = %record.address,
                    ?step,
                    status,
                    "node rejected step, skipping"
                );
                record.resolve(step, StepResolution::Rejected)
            }
            ConfigOutcome::TimedOut => {
                self.record_timeout(record, step);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(address = %record.address, ?step, error = %e, "unexpected step outcome");
        }
    }

    fn record_timeout(&self, record: &mut NodeRecord, step: BindStep) {
        record.step_timeouts = record.step_timeouts.saturating_add(1);
        if record.step_timeouts <= self.timeout_retries {
            tracing::debug!(
                address = %record.address,
                ?step,
                attempt = record.step_timeouts,
                "step timed out, retrying"
            );
            return;
        }

        tracing::warn!(address = %record.address, ?step, "step timed out, node degraded");
        if let Err(e) = record.resolve(step, StepResolution::TimedOut) {
            tracing::warn!(address = %record.address, ?step, error = %e, "cannot mark step timed out");
        }
    }

    async fn issue(
        &self,
        step: BindStep,
        address: Address,
        transport: &dyn MeshTransport,
    ) -> Result<()> {
        let model = step.capability().model();
        match step {
            BindStep::Bind(_) => transport.bind(address, self.app_index, model).await,
            BindStep::Subscribe(_) => transport.subscribe(address, self.group, model).await,
        }
    }
}
