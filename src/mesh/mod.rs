//! Mesh transport seam
//!
//! The transport service (provisioning handshake, key material, relay,
//! segmentation) lives outside this crate. Every request here is
//! fire-and-forget: the call only says whether the request left this device,
//! and the outcome arrives later as a [`MeshEvent`] on the channel owned by
//! the role loop.

pub mod sim;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Group address every vendor server subscribes to for `ALL` commands
pub const GROUP_ADDRESS: Address = Address(0xC000);

/// Company identifier of the vendor command models
pub const CID_VENDOR: u16 = 0x02E5;

/// SIG generic on/off server model
pub const MODEL_GEN_ONOFF_SRV: u16 = 0x1000;

/// SIG generic on/off client model
pub const MODEL_GEN_ONOFF_CLI: u16 = 0x1001;

/// Vendor command server model
pub const MODEL_VND_SERVER: u16 = 0x0001;

/// Vendor command client model
pub const MODEL_VND_CLIENT: u16 = 0x0000;

/// A 16-bit mesh address
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u16);

impl Address {
    /// The unassigned address
    pub const UNASSIGNED: Self = Self(0);

    #[must_use]
    pub const fn is_unassigned(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_unicast(self) -> bool {
        self.0 >= 0x0001 && self.0 <= 0x7FFF
    }

    #[must_use]
    pub const fn is_group(self) -> bool {
        self.0 >= 0xC000
    }

    /// Address `n` slots after this one
    #[must_use]
    pub const fn offset(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 16-byte device identifier advertised before enrollment
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 16]);

impl DeviceId {
    /// Whether the identifier starts with the enrollment filter prefix
    #[must_use]
    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

/// Model identifier: SIG models carry no company id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub company: Option<u16>,
    pub id: u16,
}

impl ModelId {
    #[must_use]
    pub const fn sig(id: u16) -> Self {
        Self { company: None, id }
    }

    #[must_use]
    pub const fn vendor(company: u16, id: u16) -> Self {
        Self {
            company: Some(company),
            id,
        }
    }
}

/// Capabilities the orchestration layer knows how to bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Actuator (generic on/off) server
    ActuatorServer,
    /// Actuator (generic on/off) client
    ActuatorClient,
    /// Vendor text-command server
    VendorServer,
    /// Vendor text-command client
    VendorClient,
}

impl Capability {
    /// Every known capability, in bind priority order
    pub const ALL: [Self; 4] = [
        Self::ActuatorServer,
        Self::ActuatorClient,
        Self::VendorServer,
        Self::VendorClient,
    ];

    /// Model identifier advertised for this capability
    #[must_use]
    pub const fn model(self) -> ModelId {
        match self {
            Self::ActuatorServer => ModelId::sig(MODEL_GEN_ONOFF_SRV),
            Self::ActuatorClient => ModelId::sig(MODEL_GEN_ONOFF_CLI),
            Self::VendorServer => ModelId::vendor(CID_VENDOR, MODEL_VND_SERVER),
            Self::VendorClient => ModelId::vendor(CID_VENDOR, MODEL_VND_CLIENT),
        }
    }

    /// Map a model identifier back to a known capability
    #[must_use]
    pub fn from_model(model: ModelId) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.model() == model)
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::ActuatorServer => 0,
            Self::ActuatorClient => 1,
            Self::VendorServer => 2,
            Self::VendorClient => 3,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ActuatorServer => "actuator server",
            Self::ActuatorClient => "actuator client",
            Self::VendorServer => "vendor server",
            Self::VendorClient => "vendor client",
        }
    }
}

/// Application-level opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Vendor text command
    VendorSend,
    /// Vendor text reply
    VendorStatus,
    /// On/off state query
    OnOffGet,
    /// On/off state set (acknowledged)
    OnOffSet,
    /// On/off state report
    OnOffStatus,
}

/// Application key material handed to the transport
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppKey {
    pub net_index: u16,
    pub app_index: u16,
    pub key: [u8; 16],
}

impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKey")
            .field("net_index", &self.net_index)
            .field("app_index", &self.app_index)
            .finish_non_exhaustive()
    }
}

/// An application message to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub dst: Address,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    /// Delivery window after which the transport reports a timeout
    pub timeout: Duration,
}

/// Configuration request issued by the provisioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigRequest {
    CompositionGet,
    AppKeyAdd,
    ModelAppBind(Capability),
    ModelSubscribe(Capability),
}

/// How the remote answered a configuration request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    Acknowledged,
    /// Remote refused with a status code (e.g. no such model)
    Rejected(u8),
    /// No answer within the transport's delivery window
    TimedOut,
}

/// Completion events delivered by the mesh transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Local network and application keys are usable
    LocalKeysReady { net_index: u16, app_index: u16 },
    /// An unprovisioned device advertised itself
    DeviceDiscovered { device_id: DeviceId },
    /// Enrollment handshake finished and an address was assigned
    EnrollmentComplete {
        device_id: DeviceId,
        node_index: u16,
        address: Address,
        element_count: u8,
    },
    /// Enrollment link closed (success or failure)
    EnrollmentClosed { device_id: DeviceId, reason: u8 },
    /// Capability advertisement from a node
    CompositionReceived { address: Address, data: Vec<u8> },
    /// Answer to a configuration request
    ConfigStatus {
        address: Address,
        request: ConfigRequest,
        outcome: ConfigOutcome,
    },
    /// This device was provisioned
    Provisioned { address: Address, net_index: u16 },
    /// The provisioner installed an application key on this device
    AppKeyAdded { net_index: u16, app_index: u16 },
    /// The provisioner bound one of this device's models
    ModelBound { model: ModelId, app_index: u16 },
    /// Application reply from another node
    Reply {
        source: Address,
        opcode: Opcode,
        payload: Vec<u8>,
        in_reply_to: Opcode,
    },
    /// A send never left this device
    SendFailed { target: Address, reason: String },
    /// No reply within the delivery window
    Timeout { target: Address, opcode: Opcode },
}

/// Requests the orchestration layer issues to the mesh transport
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Install the provisioner's local keys; completes with `LocalKeysReady`
    async fn install_local_keys(&self, key: &AppKey) -> Result<()>;

    /// Start scanning for unprovisioned devices whose id starts with `filter_prefix`
    async fn enroll(&self, filter_prefix: &[u8]) -> Result<()>;

    /// Run the enrollment handshake with a discovered device
    async fn provision(&self, device_id: DeviceId) -> Result<()>;

    /// Ask a node for its capability advertisement
    async fn request_capabilities(&self, address: Address) -> Result<()>;

    /// Install the application key on a node
    async fn install_key(&self, address: Address, key: &AppKey) -> Result<()>;

    /// Bind a node's model to the application key
    async fn bind(&self, address: Address, app_index: u16, model: ModelId) -> Result<()>;

    /// Subscribe a node's model to a group address
    async fn subscribe(&self, address: Address, group: Address, model: ModelId) -> Result<()>;

    /// Send an application message (unicast or group)
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}
