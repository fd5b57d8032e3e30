//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use meshlink_gateway::bridge::{Notifier, Reassembler, ResponseBridge};
use meshlink_gateway::db::MemoryStore;
use meshlink_gateway::mesh::sim::{SimDevice, SimulatedLoad, SimulatedMesh};
use meshlink_gateway::mesh::{
    Address, AppKey, Capability, DeviceId, MeshEvent, MeshTransport, ModelId, OutboundMessage,
};
use meshlink_gateway::{CommandRouter, Config, Error, Result};

/// Address of this gateway in the tests
pub const OWN: Address = Address(0x0005);

/// Test configuration with short timings
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.data_dir = std::env::temp_dir().join("meshlink-test");
    config.timing.send_ceiling = Duration::from_millis(500);
    config.timing.send_recheck = Duration::from_millis(10);
    config.timing.disarm_wait = Duration::from_millis(300);
    config.timing.monitor_interval = Duration::from_millis(100);
    config.timing.fallback_pause = Duration::from_millis(20);
    config.timing.vendor_timeout = Duration::from_millis(400);
    config.timing.onoff_timeout = Duration::from_millis(200);
    config
}

pub fn device_id(n: u8) -> DeviceId {
    let mut raw = [0u8; 16];
    raw[0] = 0xdd;
    raw[1] = 0xdd;
    raw[15] = n;
    DeviceId(raw)
}

/// Notifier that keeps every frame it was given
pub struct RecordingNotifier {
    limit: usize,
    connected: AtomicBool,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            connected: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    #[must_use]
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Whole messages reassembled from the frames
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        let mut rx = Reassembler::new();
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|f| rx.push(f))
            .map(|m| String::from_utf8(m).unwrap())
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn frame_limit(&self) -> usize {
        self.limit
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn notify(&self, frame: &[u8]) -> Result<()> {
        assert!(frame.len() <= self.limit, "frame over limit");
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// A request issued to [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InstallLocalKeys,
    Enroll,
    Provision(DeviceId),
    RequestCapabilities(Address),
    InstallKey(Address),
    Bind(Address, ModelId),
    Subscribe(Address, Address, ModelId),
    Send(OutboundMessage),
}

/// Transport that records requests and never produces events
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    fail_sends: AtomicBool,
    unreachable: Mutex<Vec<Address>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Refuse sends to `address` only
    pub fn refuse(&self, address: Address) {
        self.unreachable.lock().unwrap().push(address);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Application messages sent so far
    #[must_use]
    pub fn sends(&self) -> Vec<OutboundMessage> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MeshTransport for RecordingTransport {
    async fn install_local_keys(&self, _key: &AppKey) -> Result<()> {
        self.record(Call::InstallLocalKeys);
        Ok(())
    }

    async fn enroll(&self, _filter_prefix: &[u8]) -> Result<()> {
        self.record(Call::Enroll);
        Ok(())
    }

    async fn provision(&self, device_id: DeviceId) -> Result<()> {
        self.record(Call::Provision(device_id));
        Ok(())
    }

    async fn request_capabilities(&self, address: Address) -> Result<()> {
        self.record(Call::RequestCapabilities(address));
        Ok(())
    }

    async fn install_key(&self, address: Address, _key: &AppKey) -> Result<()> {
        self.record(Call::InstallKey(address));
        Ok(())
    }

    async fn bind(&self, address: Address, _app_index: u16, model: ModelId) -> Result<()> {
        self.record(Call::Bind(address, model));
        Ok(())
    }

    async fn subscribe(&self, address: Address, group: Address, model: ModelId) -> Result<()> {
        self.record(Call::Subscribe(address, group, model));
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("radio off".to_string()));
        }
        if self.unreachable.lock().unwrap().contains(&message.dst) {
            return Err(Error::Transport("no route".to_string()));
        }
        self.record(Call::Send(message));
        Ok(())
    }
}

/// Router wired to a recording transport; events are fed by hand
pub struct RecordedGateway {
    pub router: CommandRouter,
    pub transport: Arc<RecordingTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub load: SimulatedLoad,
    pub store: Arc<MemoryStore>,
}

impl RecordedGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let config = test_config();
        let transport = RecordingTransport::new();
        let notifier = RecordingNotifier::new(config.bridge.frame_limit);
        let bridge = ResponseBridge::new(
            notifier.clone(),
            config.mesh.node_base_address,
            config.bridge.max_message_len,
        );
        let load = SimulatedLoad::new();
        let router = CommandRouter::new(
            &config,
            transport.clone(),
            bridge,
            Arc::new(load.clone()),
            store.clone(),
        )
        .unwrap();
        Self {
            router,
            transport,
            notifier,
            load,
            store,
        }
    }

    /// Provisioned at [`OWN`] with the application key but no model bound
    pub async fn keyed(self) -> Self {
        self.router
            .handle_event(MeshEvent::Provisioned {
                address: OWN,
                net_index: 0,
            })
            .await;
        self.router
            .handle_event(MeshEvent::AppKeyAdded {
                net_index: 0,
                app_index: 0,
            })
            .await;
        self
    }

    /// Keyed and with the vendor client bound
    pub async fn bound(self) -> Self {
        let gw = self.keyed().await;
        gw.router
            .handle_event(MeshEvent::ModelBound {
                model: Capability::VendorClient.model(),
                app_index: 0,
            })
            .await;
        gw.notifier.clear();
        gw
    }
}

/// Router on the simulated mesh with its event loop running
pub struct SimGateway {
    pub router: Arc<CommandRouter>,
    pub mesh: Arc<SimulatedMesh>,
    pub notifier: Arc<RecordingNotifier>,
    pub load: SimulatedLoad,
    event_loop: JoinHandle<()>,
}

impl SimGateway {
    /// Gateway at [`OWN`] with `nodes` vendor nodes right after it, bound
    pub async fn start(nodes: u16) -> Self {
        let config = test_config();
        let (mesh, mut events) = SimulatedMesh::new(Duration::ZERO);
        for i in 1..=nodes {
            let n = u8::try_from(i).unwrap();
            mesh.add_device(
                SimDevice::new(
                    device_id(n),
                    &[Capability::ActuatorServer, Capability::VendorServer],
                )
                .at(OWN.offset(i)),
            );
        }
        let mesh = Arc::new(mesh);

        let notifier = RecordingNotifier::new(config.bridge.frame_limit);
        let bridge = ResponseBridge::new(
            notifier.clone(),
            config.mesh.node_base_address,
            config.bridge.max_message_len,
        );
        let load = SimulatedLoad::new();
        let router = Arc::new(
            CommandRouter::new(
                &config,
                mesh.clone(),
                bridge,
                Arc::new(load.clone()),
                Arc::new(MemoryStore::new()),
            )
            .unwrap(),
        );

        let event_router = Arc::clone(&router);
        let event_loop = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                event_router.handle_event(event).await;
            }
        });

        mesh.inject(MeshEvent::Provisioned {
            address: OWN,
            net_index: 0,
        });
        mesh.inject(MeshEvent::AppKeyAdded {
            net_index: 0,
            app_index: 0,
        });
        mesh.inject(MeshEvent::ModelBound {
            model: Capability::VendorClient.model(),
            app_index: 0,
        });
        settle().await;
        notifier.clear();

        Self {
            router,
            mesh,
            notifier,
            load,
            event_loop,
        }
    }

    /// Load of the simulated node at `OWN + index`
    #[must_use]
    pub fn node_load(&self, index: u16) -> SimulatedLoad {
        self.mesh
            .devices()
            .into_iter()
            .find(|d| d.address() == Some(OWN.offset(index)))
            .map(|d| d.load)
            .unwrap()
    }
}

impl Drop for SimGateway {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// Let spawned tasks drain pending events
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
