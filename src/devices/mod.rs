//! Simulated plant devices and their periodic controllers.
//!
//! Every controller owns its device's register store and reaches other
//! devices only through [`RegisterPeer`] round-trips.

pub mod bms;
pub mod layout;
pub mod meter;
pub mod pcs;
pub mod pms;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ClientError, DeviceError};
use crate::modbus::RegisterPeer;

pub use bms::BmsController;
pub use layout::{build_context, Layout};
pub use meter::MeterController;
pub use pcs::PcsController;
pub use pms::{PcsLink, PmsController};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    Pms,
    Pcs,
    Bms,
    Meter,
}

impl DeviceKind {
    pub fn layout(self) -> &'static Layout {
        match self {
            DeviceKind::Pms => &layout::PMS,
            DeviceKind::Pcs => &layout::PCS,
            DeviceKind::Bms => &layout::BMS,
            DeviceKind::Meter => &layout::METER,
        }
    }
}

/// One periodic device state machine.
#[async_trait]
pub trait Controller: Send {
    fn name(&self) -> &str;

    /// Run one tick. Peer failures are absorbed inside the tick; an error
    /// here means the device could not update its own registers.
    async fn step(&mut self) -> Result<(), DeviceError>;
}

/// Drive `controller` every `period` until `shutdown` fires. A failed tick
/// is logged and the next one runs on schedule.
pub async fn run_controller(
    mut controller: Box<dyn Controller>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(device = %controller.name(), period_ms = period.as_millis() as u64, "controller started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = controller.step().await {
            warn!(device = %controller.name(), error = %e, "controller tick failed");
        }
    }
    info!(device = %controller.name(), "controller stopped");
}

/// Read a single input register from a peer.
pub(crate) async fn read_input(peer: &dyn RegisterPeer, address: u16) -> Result<u16, ClientError> {
    let words = peer.read_input_registers(address, 1).await?;
    words
        .first()
        .copied()
        .ok_or_else(|| ClientError::UnexpectedResponse("empty register list".into()))
}
