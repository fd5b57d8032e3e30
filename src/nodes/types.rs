//! Node record types for the provisioner
//!
//! Capability and binding progress is kept as one state per capability
//! rather than paired flags, so a bound-but-not-advertised model cannot be
//! represented.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mesh::{Address, Capability, DeviceId};
use crate::provisioning::BindStep;
use crate::{Error, Result};

/// Set of capabilities found in a capability advertisement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn insert(&mut self, capability: Capability) {
        self.0 |= 1 << capability.index();
    }

    #[must_use]
    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & (1 << capability.index()) != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Capabilities present, in bind priority order
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::new();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

/// Per-capability binding state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// Not advertised by the node
    #[default]
    Absent,
    /// Advertised, bind not completed yet
    Unbound,
    /// Bound to the application key
    Bound,
    /// Node refused the bind (advertised but not actually registered)
    Rejected,
    /// Bind never answered within the retry budget
    TimedOut,
}

/// Group subscription state of the vendor server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    #[default]
    Unsubscribed,
    Subscribed,
    Rejected,
    TimedOut,
}

/// How a bind or subscribe step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResolution {
    Done,
    Rejected,
    TimedOut,
}

/// Where a device is in the provisioning workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    Discovered,
    Enrolling,
    AwaitingCapabilities,
    KeyInstalling,
    Binding(BindStep),
    FullyConfigured,
}

/// Inputs that move a device between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTrigger {
    EnrollmentStarted,
    Enrolled,
    CapabilitiesReceived,
    StepIssued(BindStep),
    Configured,
}

impl ProvisioningPhase {
    /// Transition table; `None` marks an illegal transition
    #[must_use]
    pub const fn transition(self, trigger: PhaseTrigger) -> Option<Self> {
        use PhaseTrigger as T;
        match (self, trigger) {
            (Self::Discovered, T::EnrollmentStarted) => Some(Self::Enrolling),
            // re-enrollment restarts the workflow from any phase
            (_, T::Enrolled) => Some(Self::AwaitingCapabilities),
            (Self::AwaitingCapabilities, T::CapabilitiesReceived) => Some(Self::KeyInstalling),
            (Self::KeyInstalling | Self::Binding(_), T::StepIssued(step)) => {
                Some(Self::Binding(step))
            }
            (Self::KeyInstalling | Self::Binding(_) | Self::FullyConfigured, T::Configured) => {
                Some(Self::FullyConfigured)
            }
            _ => None,
        }
    }
}

/// A device known to the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub device_id: DeviceId,
    pub address: Address,
    pub element_count: u8,
    pub display_name: String,
    pub phase: ProvisioningPhase,
    /// Transport timeouts seen for the step currently in flight
    pub step_timeouts: u8,
    pub enrolled_at: DateTime<Utc>,
    models: [ModelState; 4],
    group: GroupState,
}

impl NodeRecord {
    /// Record for a freshly enrolled device
    #[must_use]
    pub fn new(device_id: DeviceId, node_index: u16, address: Address, element_count: u8) -> Self {
        Self {
            device_id,
            address,
            element_count,
            display_name: format!("NODE-{node_index}"),
            phase: ProvisioningPhase::AwaitingCapabilities,
            step_timeouts: 0,
            enrolled_at: Utc::now(),
            models: [ModelState::Absent; 4],
            group: GroupState::Unsubscribed,
        }
    }

    /// Whether `address` falls inside this node's element span
    #[must_use]
    pub fn contains_address(&self, address: Address) -> bool {
        let start = u32::from(self.address.0);
        let end = start + u32::from(self.element_count.max(1));
        (start..end).contains(&u32::from(address.0))
    }

    /// Replace advertised capabilities; all binding progress restarts
    pub fn apply_capabilities(&mut self, capabilities: CapabilitySet) {
        for cap in Capability::ALL {
            self.models[cap.index()] = if capabilities.contains(cap) {
                ModelState::Unbound
            } else {
                ModelState::Absent
            };
        }
        self.group = GroupState::Unsubscribed;
        self.step_timeouts = 0;
    }

    /// Capabilities the node advertised
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        Capability::ALL
            .into_iter()
            .filter(|c| self.models[c.index()] != ModelState::Absent)
            .collect()
    }

    #[must_use]
    pub const fn model_state(&self, capability: Capability) -> ModelState {
        self.models[capability.index()]
    }

    #[must_use]
    pub const fn group_state(&self) -> GroupState {
        self.group
    }

    #[must_use]
    pub fn is_bound(&self, capability: Capability) -> bool {
        self.model_state(capability) == ModelState::Bound
    }

    #[must_use]
    pub fn is_group_subscribed(&self) -> bool {
        self.group == GroupState::Subscribed
    }

    /// Whether `step` still has work to do: its capability is advertised and
    /// the step has not resolved
    #[must_use]
    pub fn step_pending(&self, step: BindStep) -> bool {
        let cap = step.capability();
        if self.model_state(cap) == ModelState::Absent {
            return false;
        }
        match step {
            BindStep::Bind(_) => self.model_state(cap) == ModelState::Unbound,
            BindStep::Subscribe(_) => self.group == GroupState::Unsubscribed,
        }
    }

    /// Record how a step ended
    ///
    /// # Errors
    ///
    /// Returns error if the step's capability was never advertised
    pub fn resolve(&mut self, step: BindStep, resolution: StepResolution) -> Result<()> {
        let cap = step.capability();
        if self.model_state(cap) == ModelState::Absent {
            return Err(Error::Capability(format!(
                "{} not advertised by {}",
                cap.name(),
                self.address
            )));
        }

        match step {
            BindStep::Bind(_) => {
                let slot = &mut self.models[cap.index()];
                // bound is terminal
                if *slot != ModelState::Bound {
                    *slot = match resolution {
                        StepResolution::Done => ModelState::Bound,
                        StepResolution::Rejected => ModelState::Rejected,
                        StepResolution::TimedOut => ModelState::TimedOut,
                    };
                }
            }
            BindStep::Subscribe(_) => {
                if self.group != GroupState::Subscribed {
                    self.group = match resolution {
                        StepResolution::Done => GroupState::Subscribed,
                        StepResolution::Rejected => GroupState::Rejected,
                        StepResolution::TimedOut => GroupState::TimedOut,
                    };
                }
            }
        }
        self.step_timeouts = 0;
        Ok(())
    }

    /// A step gave up after repeated transport timeouts
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.models.contains(&ModelState::TimedOut) || self.group == GroupState::TimedOut
    }

    /// Move to the next phase; illegal transitions are logged and ignored
    pub fn advance_phase(&mut self, trigger: PhaseTrigger) -> bool {
        if let Some(next) = self.phase.transition(trigger) {
            self.phase = next;
            true
        } else {
            tracing::warn!(
                address = %self.address,
                phase = ?self.phase,
                ?trigger,
                "illegal phase transition ignored"
            );
            false
        }
    }

    #[must_use]
    pub fn is_fully_configured(&self) -> bool {
        self.phase == ProvisioningPhase::FullyConfigured
    }
}
