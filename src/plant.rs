//! Launch a set of configured devices.
//!
//! Each device gets its own register store, listener and controller.
//! Controllers reach their peers only through Modbus TCP clients, even when
//! the peer runs in the same process.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, DeviceConfig};
use crate::devices::{
    build_context, run_controller, BmsController, Controller, DeviceKind, MeterController,
    PcsController, PcsLink, PmsController,
};
use crate::modbus::{ModbusTcpClient, ModbusTcpServer, RegisterPeer};
use crate::registers::{DeviceContext, ServerContext};

/// Running devices. Dropping it leaves the tasks running; call
/// [`Plant::shutdown`] to stop them.
pub struct Plant {
    shutdown: CancellationToken,
    addrs: BTreeMap<String, SocketAddr>,
    devices: BTreeMap<String, Arc<DeviceContext>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Plant {
    /// Bind every selected device, then start the controllers. An empty
    /// `only` selects all devices. Any bind failure aborts the launch.
    pub async fn launch(cfg: &Config, only: &[String]) -> Result<Self> {
        for name in only {
            if cfg.device(name).is_none() {
                bail!("unknown device {name}");
            }
        }
        let selected: Vec<&DeviceConfig> = cfg
            .devices
            .iter()
            .filter(|d| only.is_empty() || only.contains(&d.name))
            .collect();

        let shutdown = CancellationToken::new();
        let mut addrs = BTreeMap::new();
        let mut devices = BTreeMap::new();
        let mut servers = Vec::new();
        let mut bound = Vec::new();

        for device in &selected {
            let context = Arc::new(
                build_context(device.kind, device.unit_id, &device.initial_values())
                    .with_context(|| format!("building registers of {}", device.name))?,
            );
            let faults = device.faults.clone().unwrap_or_else(|| cfg.faults.clone());
            let server = ModbusTcpServer::bind(
                (cfg.plant.host.as_str(), device.port),
                Arc::new(ServerContext::single(Arc::clone(&context))),
                faults,
            )
            .await
            .with_context(|| format!("binding {} to {}:{}", device.name, cfg.plant.host, device.port))?;

            let addr = server.local_addr()?;
            info!(device = %device.name, kind = %device.kind, unit = device.unit_id, %addr, "device bound");
            addrs.insert(device.name.clone(), addr);
            devices.insert(device.name.clone(), Arc::clone(&context));
            bound.push((*device, context));
            servers.push(server);
        }

        let mut tasks: Vec<JoinHandle<()>> = servers
            .into_iter()
            .map(|server| tokio::spawn(server.run(shutdown.child_token())))
            .collect();

        let wiring = Wiring { cfg, addrs: &addrs };
        for (device, context) in bound {
            let controller = wiring.controller(device, context);
            tasks.push(tokio::spawn(run_controller(
                controller,
                cfg.plant.tick_interval(),
                shutdown.child_token(),
            )));
        }

        Ok(Self {
            shutdown,
            addrs,
            devices,
            tasks,
        })
    }

    pub fn addr(&self, name: &str) -> Option<SocketAddr> {
        self.addrs.get(name).copied()
    }

    /// Local register store of a device running in this plant.
    pub fn device(&self, name: &str) -> Option<&Arc<DeviceContext>> {
        self.devices.get(name)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every listener and controller and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("plant stopped");
    }
}

/// Resolves peers of a device into Modbus clients.
struct Wiring<'a> {
    cfg: &'a Config,
    addrs: &'a BTreeMap<String, SocketAddr>,
}

impl Wiring<'_> {
    /// Devices launched here are reached at their bound address; others at
    /// the configured host and port.
    fn peer(&self, device: &DeviceConfig) -> Arc<dyn RegisterPeer> {
        let addr = match self.addrs.get(&device.name) {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", self.cfg.plant.host, device.port),
        };
        Arc::new(ModbusTcpClient::new(
            device.name.clone(),
            addr,
            device.unit_id,
            self.cfg.client,
        ))
    }

    fn controller(&self, device: &DeviceConfig, context: Arc<DeviceContext>) -> Box<dyn Controller> {
        let name = device.name.clone();
        match device.kind {
            DeviceKind::Pcs => {
                let bms = self.cfg.bms_for(&device.name).map(|b| self.peer(b));
                Box::new(PcsController::new(name, context, bms))
            }
            DeviceKind::Bms => {
                let pcs = self.cfg.pcs_for(&device.name).map(|p| self.peer(p));
                Box::new(BmsController::new(name, context, pcs))
            }
            DeviceKind::Pms => {
                let links = self
                    .cfg
                    .devices_of(DeviceKind::Pcs)
                    .map(|pcs| PcsLink {
                        pcs: self.peer(pcs),
                        bms: self.cfg.bms_for(&pcs.name).map(|b| self.peer(b)),
                    })
                    .collect();
                Box::new(PmsController::new(name, context, links))
            }
            DeviceKind::Meter => {
                let pcs = self
                    .cfg
                    .devices_of(DeviceKind::Pcs)
                    .map(|p| self.peer(p))
                    .collect();
                Box::new(MeterController::new(name, context, pcs, device.loss_ratio()))
            }
        }
    }
}
