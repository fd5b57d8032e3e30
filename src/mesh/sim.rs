//! In-memory mesh used by the demo roles and by tests
//!
//! Devices answer the way the deployed sensor nodes do: vendor commands get a
//! sensor reading back, on/off sets get a status, configuration requests are
//! acknowledged unless the device does not really host the model.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Address, AppKey, Capability, ConfigOutcome, ConfigRequest, DeviceId, MeshEvent, MeshTransport,
    ModelId, Opcode, OutboundMessage,
};
use crate::nodes::CapabilitySet;
use crate::router::LocalExecutor;
use crate::{Error, Result};

/// Status code a node returns when asked to bind a model it does not have
pub const STATUS_INVALID_MODEL: u8 = 0x02;

/// Link-close reason when a device does not answer the enrollment handshake
pub const ENROLL_FAIL_NO_ANSWER: u8 = 0x01;

/// Supply voltage reported by simulated loads
const SUPPLY_VOLTS: f32 = 12.0;

/// Current drawn per duty percent, in milliamps
const MILLIAMPS_PER_PERCENT: f32 = 5.0;

/// Build a capability advertisement for a single-element device
///
/// The configuration server model is always listed first, as real nodes do.
#[must_use]
pub fn composition_blob(capabilities: &[Capability]) -> Vec<u8> {
    // cid, pid, vid, crpl, features
    let mut blob = vec![0xE5, 0x02, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x03, 0x00];

    let mut sig = vec![0x0000_u16];
    let mut vendor = Vec::new();
    for cap in capabilities {
        let model = cap.model();
        match model.company {
            Some(company) => vendor.push((company, model.id)),
            None => sig.push(model.id),
        }
    }

    // location
    blob.extend_from_slice(&[0x00, 0x00]);
    blob.push(u8::try_from(sig.len()).unwrap_or(u8::MAX));
    blob.push(u8::try_from(vendor.len()).unwrap_or(u8::MAX));
    for id in sig {
        blob.extend_from_slice(&id.to_le_bytes());
    }
    for (company, id) in vendor {
        blob.extend_from_slice(&company.to_le_bytes());
        blob.extend_from_slice(&id.to_le_bytes());
    }
    blob
}

/// Simulated PWM load with a current sensor
#[derive(Debug, Clone, Default)]
pub struct SimulatedLoad {
    duty: Arc<AtomicU8>,
}

impl SimulatedLoad {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current duty cycle in percent
    #[must_use]
    pub fn duty(&self) -> u8 {
        self.duty.load(Ordering::SeqCst)
    }

    /// Set the duty cycle, clamped to 0..=100
    pub fn set_duty(&self, percent: i64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let clamped = percent.clamp(0, 100) as u8;
        self.duty.store(clamped, Ordering::SeqCst);
    }

    /// Sensor reading in the node's reply format
    #[must_use]
    pub fn reading(&self) -> String {
        let duty = self.duty();
        let current = f32::from(duty) * MILLIAMPS_PER_PERCENT;
        let power = (SUPPLY_VOLTS * current).abs();
        format!("D:{duty}%,V:{SUPPLY_VOLTS:.3}V,I:{current:.2}mA,P:{power:.1}mW")
    }

    /// Run one wire command and return the reply text
    #[must_use]
    pub fn run(&self, command: &str) -> String {
        let command = command.trim();
        match command {
            "s" | "stop" => self.set_duty(0),
            "r" | "ramp" => {
                for step in (0..=100).step_by(25) {
                    self.set_duty(step);
                    tracing::debug!(duty = step, reading = %self.reading(), "ramp step");
                }
                self.set_duty(0);
            }
            "read" | "status" => {}
            _ => {
                if let Some(value) = command.strip_prefix("duty:") {
                    self.set_duty(value.trim().parse().unwrap_or(0));
                } else if let Ok(value) = command.parse::<i64>() {
                    self.set_duty(value);
                } else {
                    return format!("ERR:UNKNOWN:{command}");
                }
            }
        }
        self.reading()
    }
}

#[async_trait]
impl LocalExecutor for SimulatedLoad {
    async fn execute(&self, command: &str) -> String {
        self.run(command)
    }
}

/// A virtual device living on the simulated mesh
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub device_id: DeviceId,
    /// Models the device really registered
    pub hosted: CapabilitySet,
    /// Models listed in its capability advertisement
    pub advertised: CapabilitySet,
    pub element_count: u8,
    pub load: SimulatedLoad,
    address: Option<Address>,
}

impl SimDevice {
    /// Unprovisioned device hosting and advertising `capabilities`
    #[must_use]
    pub fn new(device_id: DeviceId, capabilities: &[Capability]) -> Self {
        let set: CapabilitySet = capabilities.iter().copied().collect();
        Self {
            device_id,
            hosted: set,
            advertised: set,
            element_count: 1,
            load: SimulatedLoad::new(),
            address: None,
        }
    }

    /// Advertise more than the device actually hosts
    #[must_use]
    pub fn advertising(mut self, capabilities: &[Capability]) -> Self {
        self.advertised = capabilities.iter().copied().collect();
        self
    }

    #[must_use]
    pub const fn with_elements(mut self, element_count: u8) -> Self {
        self.element_count = element_count;
        self
    }

    /// Already provisioned at `address`
    #[must_use]
    pub const fn at(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub const fn address(&self) -> Option<Address> {
        self.address
    }
}

#[derive(Debug)]
struct SimState {
    devices: Vec<SimDevice>,
    next_address: Address,
    next_node_index: u16,
}

/// Simulated mesh transport
#[derive(Debug)]
pub struct SimulatedMesh {
    events: mpsc::UnboundedSender<MeshEvent>,
    latency: Duration,
    fail_sends: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedMesh {
    /// Create a mesh whose events arrive on the returned receiver after `latency`
    #[must_use]
    pub fn new(latency: Duration) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mesh = Self {
            events: tx,
            latency,
            fail_sends: AtomicBool::new(false),
            state: Mutex::new(SimState {
                devices: Vec::new(),
                next_address: Address(0x0005),
                next_node_index: 0,
            }),
        };
        (mesh, rx)
    }

    /// First unicast address handed out at enrollment
    pub fn set_first_address(&self, address: Address) {
        self.lock().next_address = address;
    }

    pub fn add_device(&self, device: SimDevice) {
        self.lock().devices.push(device);
    }

    /// Make every application send fail before leaving this device
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the devices on the mesh
    #[must_use]
    pub fn devices(&self) -> Vec<SimDevice> {
        self.lock().devices.clone()
    }

    /// Inject an event as if the transport had produced it
    pub fn inject(&self, event: MeshEvent) {
        self.emit_after(Duration::ZERO, event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device_at(&self, address: Address) -> Option<SimDevice> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.address == Some(address))
            .cloned()
    }

    fn emit(&self, event: MeshEvent) {
        self.emit_after(self.latency, event);
    }

    fn emit_after(&self, delay: Duration, event: MeshEvent) {
        if delay.is_zero() {
            let _ = self.events.send(event);
            return;
        }
        let tx = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn config_status(&self, address: Address, request: ConfigRequest, outcome: ConfigOutcome) {
        self.emit(MeshEvent::ConfigStatus {
            address,
            request,
            outcome,
        });
    }

    fn hosted_outcome(&self, address: Address, model: ModelId) -> (Option<Capability>, ConfigOutcome) {
        let Some(device) = self.device_at(address) else {
            return (Capability::from_model(model), ConfigOutcome::TimedOut);
        };
        match Capability::from_model(model) {
            Some(cap) if device.hosted.contains(cap) => (Some(cap), ConfigOutcome::Acknowledged),
            cap => (cap, ConfigOutcome::Rejected(STATUS_INVALID_MODEL)),
        }
    }

    fn answer(&self, device: &SimDevice, message: &OutboundMessage) -> Option<MeshEvent> {
        let source = device.address?;
        match message.opcode {
            Opcode::VendorSend => {
                if !device.hosted.contains(Capability::VendorServer) {
                    return None;
                }
                let command = String::from_utf8_lossy(&message.payload);
                Some(MeshEvent::Reply {
                    source,
                    opcode: Opcode::VendorStatus,
                    payload: device.load.run(&command).into_bytes(),
                    in_reply_to: Opcode::VendorSend,
                })
            }
            Opcode::OnOffSet | Opcode::OnOffGet => {
                if !device.hosted.contains(Capability::ActuatorServer) {
                    return None;
                }
                if message.opcode == Opcode::OnOffSet {
                    match message.payload.first() {
                        Some(0) => device.load.set_duty(0),
                        _ => device.load.set_duty(100),
                    }
                }
                Some(MeshEvent::Reply {
                    source,
                    opcode: Opcode::OnOffStatus,
                    payload: vec![u8::from(device.load.duty() > 0)],
                    in_reply_to: message.opcode,
                })
            }
            Opcode::VendorStatus | Opcode::OnOffStatus => None,
        }
    }
}

#[async_trait]
impl MeshTransport for SimulatedMesh {
    async fn install_local_keys(&self, key: &AppKey) -> Result<()> {
        self.emit(MeshEvent::LocalKeysReady {
            net_index: key.net_index,
            app_index: key.app_index,
        });
        Ok(())
    }

    async fn enroll(&self, filter_prefix: &[u8]) -> Result<()> {
        let found: Vec<DeviceId> = self
            .lock()
            .devices
            .iter()
            .filter(|d| d.address.is_none() && d.device_id.matches_prefix(filter_prefix))
            .map(|d| d.device_id)
            .collect();
        for device_id in found {
            self.emit(MeshEvent::DeviceDiscovered { device_id });
        }
        Ok(())
    }

    async fn provision(&self, device_id: DeviceId) -> Result<()> {
        let assigned = {
            let mut state = self.lock();
            let address = state.next_address;
            let node_index = state.next_node_index;
            let Some(device) = state.devices.iter_mut().find(|d| d.device_id == device_id) else {
                return Err(Error::Transport(format!("no device {device_id} in range")));
            };
            if device.address.is_some() {
                // already provisioned, the handshake goes unanswered
                None
            } else {
                device.address = Some(address);
                let element_count = device.element_count;
                state.next_address = address.offset(u16::from(element_count.max(1)));
                state.next_node_index += 1;
                Some((node_index, address, element_count))
            }
        };

        let Some((node_index, address, element_count)) = assigned else {
            self.emit(MeshEvent::EnrollmentClosed {
                device_id,
                reason: ENROLL_FAIL_NO_ANSWER,
            });
            return Ok(());
        };
        self.emit(MeshEvent::EnrollmentComplete {
            device_id,
            node_index,
            address,
            element_count,
        });
        self.emit(MeshEvent::EnrollmentClosed {
            device_id,
            reason: 0,
        });
        Ok(())
    }

    async fn request_capabilities(&self, address: Address) -> Result<()> {
        match self.device_at(address) {
            Some(device) => {
                let caps: Vec<Capability> = device.advertised.iter().collect();
                self.emit(MeshEvent::CompositionReceived {
                    address,
                    data: composition_blob(&caps),
                });
            }
            None => self.config_status(
                address,
                ConfigRequest::CompositionGet,
                ConfigOutcome::TimedOut,
            ),
        }
        Ok(())
    }

    async fn install_key(&self, address: Address, _key: &AppKey) -> Result<()> {
        let outcome = if self.device_at(address).is_some() {
            ConfigOutcome::Acknowledged
        } else {
            ConfigOutcome::TimedOut
        };
        self.config_status(address, ConfigRequest::AppKeyAdd, outcome);
        Ok(())
    }

    async fn bind(&self, address: Address, _app_index: u16, model: ModelId) -> Result<()> {
        let (cap, outcome) = self.hosted_outcome(address, model);
        let cap = cap.ok_or_else(|| Error::Capability(format!("unknown model {model:?}")))?;
        self.config_status(address, ConfigRequest::ModelAppBind(cap), outcome);
        Ok(())
    }

    async fn subscribe(&self, address: Address, _group: Address, model: ModelId) -> Result<()> {
        let (cap, outcome) = self.hosted_outcome(address, model);
        let cap = cap.ok_or_else(|| Error::Capability(format!("unknown model {model:?}")))?;
        self.config_status(address, ConfigRequest::ModelSubscribe(cap), outcome);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("no route to mesh".to_string()));
        }

        if message.dst.is_group() {
            let devices = self.devices();
            for device in &devices {
                if let Some(reply) = self.answer(device, &message) {
                    self.emit(reply);
                }
            }
            return Ok(());
        }

        match self.device_at(message.dst) {
            Some(device) => {
                if let Some(reply) = self.answer(&device, &message) {
                    self.emit(reply);
                } else {
                    self.emit_after(
                        message.timeout,
                        MeshEvent::Timeout {
                            target: message.dst,
                            opcode: message.opcode,
                        },
                    );
                }
            }
            None => self.emit_after(
                message.timeout,
                MeshEvent::Timeout {
                    target: message.dst,
                    opcode: message.opcode,
                },
            ),
        }
        Ok(())
    }
}
