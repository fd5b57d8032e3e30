//! Daemon - runs the gateway or provisioner role
//!
//! Both roles run against the in-memory mesh. The gateway reads one command
//! per stdin line and prints notifier output on stdout; the provisioner
//! enrolls and binds the simulated fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::bridge::{ResponseBridge, StdoutNotifier};
use crate::db::{self, DbPool, SqliteStore, StateStore};
use crate::mesh::sim::{SimDevice, SimulatedLoad, SimulatedMesh};
use crate::mesh::{Capability, DeviceId, MeshEvent};
use crate::provisioning::ProvisioningOrchestrator;
use crate::router::CommandRouter;
use crate::{Config, Result};

/// Simulated radio latency
const SIM_LATENCY: Duration = Duration::from_millis(20);

/// Nodes placed on the simulated mesh besides this device
const DEMO_FLEET_SIZE: u8 = 3;

/// The meshlink daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or database cannot be initialized
    pub fn new(config: Config) -> Result<Self> {
        config.ensure_data_dir()?;
        let db_path = config.db_path();
        let db = db::init(&db_path)?;

        tracing::info!(path = %db_path.display(), "database initialized");

        Ok(Self { config, db })
    }

    fn store(&self) -> Arc<dyn StateStore> {
        Arc::new(SqliteStore::new(self.db.clone()))
    }

    /// Run the gateway role until interrupted or stdin closes
    ///
    /// # Errors
    ///
    /// Returns error if saved state cannot be restored
    pub async fn run_gateway(self) -> Result<()> {
        let node_base = self.config.mesh.node_base_address;
        let (mesh, mut events) = SimulatedMesh::new(SIM_LATENCY);
        for (i, device) in (1..).zip(demo_fleet(DEMO_FLEET_SIZE)) {
            mesh.add_device(device.at(node_base.offset(i)));
        }
        let mesh = Arc::new(mesh);

        let notifier = Arc::new(StdoutNotifier::new(self.config.bridge.frame_limit));
        let bridge = ResponseBridge::new(notifier, node_base, self.config.bridge.max_message_len);
        let router = Arc::new(CommandRouter::new(
            &self.config,
            mesh.clone(),
            bridge,
            Arc::new(SimulatedLoad::new()),
            self.store(),
        )?);

        let event_router = Arc::clone(&router);
        let event_loop = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                event_router.handle_event(event).await;
            }
        });

        if !router.gateway_state().vendor_bound {
            // stand in for the provisioner configuring this device
            let app_index = self.config.mesh.app_key_index;
            mesh.inject(MeshEvent::Provisioned {
                address: node_base,
                net_index: self.config.mesh.net_key_index,
            });
            mesh.inject(MeshEvent::AppKeyAdded {
                net_index: self.config.mesh.net_key_index,
                app_index,
            });
            mesh.inject(MeshEvent::ModelBound {
                model: Capability::VendorClient.model(),
                app_index,
            });
        }

        let mut shutdown_rx = shutdown_signal();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        tracing::info!(
            base = %node_base,
            nodes = DEMO_FLEET_SIZE,
            "gateway running, reading commands from stdin"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        let dispatch = router.handle_command(&line).await;
                        tracing::debug!(command = %line.trim(), ?dispatch, "command handled");
                    }
                    Ok(None) => {
                        tracing::info!("command input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read command");
                        break;
                    }
                },
            }
        }

        // let replies to the last command arrive
        tokio::time::sleep(SIM_LATENCY * 2).await;
        event_loop.abort();
        tracing::info!("gateway stopped");
        Ok(())
    }

    /// Run the provisioner role until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if saved state cannot be restored or the transport
    /// refuses the local keys
    pub async fn run_provisioner(self) -> Result<()> {
        let node_base = self.config.mesh.node_base_address;
        let (mesh, mut events) = SimulatedMesh::new(SIM_LATENCY);
        mesh.set_first_address(node_base.offset(1));
        for device in demo_fleet(DEMO_FLEET_SIZE) {
            mesh.add_device(device);
        }
        // advertises a client it never registered; its bind gets rejected
        mesh.add_device(
            SimDevice::new(demo_device_id(0xff), &[Capability::ActuatorServer, Capability::VendorServer])
                .advertising(&[
                    Capability::ActuatorServer,
                    Capability::ActuatorClient,
                    Capability::VendorServer,
                ]),
        );
        let mesh = Arc::new(mesh);

        let mut orchestrator = ProvisioningOrchestrator::new(&self.config, mesh.clone(), self.store())?;
        orchestrator.start().await?;

        let mut shutdown_rx = shutdown_signal();
        tracing::info!(
            address = %self.config.mesh.provisioner_address,
            devices = mesh.devices().len(),
            "provisioner running"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    orchestrator.handle_event(event).await;
                }
            }
        }

        for record in orchestrator.registry().records() {
            tracing::info!(
                name = %record.display_name,
                address = %record.address,
                phase = ?record.phase,
                degraded = record.is_degraded(),
                "node"
            );
        }
        tracing::info!("provisioner stopped");
        Ok(())
    }
}

/// Ctrl-C delivered as a channel message
fn shutdown_signal() -> mpsc::Receiver<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });
    shutdown_rx
}

fn demo_device_id(n: u8) -> DeviceId {
    let mut raw = [0u8; 16];
    raw[0] = 0xdd;
    raw[1] = 0xdd;
    raw[15] = n;
    DeviceId(raw)
}

/// Unprovisioned sensor nodes hosting the actuator and vendor servers
fn demo_fleet(count: u8) -> Vec<SimDevice> {
    (1..=count)
        .map(|n| {
            SimDevice::new(
                demo_device_id(n),
                &[Capability::ActuatorServer, Capability::VendorServer],
            )
        })
        .collect()
}
