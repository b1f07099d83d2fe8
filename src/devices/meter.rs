use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::layout::{meter, pcs};
use super::{read_input, Controller};
use crate::error::DeviceError;
use crate::modbus::RegisterPeer;
use crate::registers::DeviceContext;
use crate::scaling::{decode_power_kw, saturate_power_kw};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterTick {
    pub pcs_ok: usize,
    pub active_power_kw: f64,
}

/// Grid-side energy meter: measures the summed PCS output minus line
/// losses.
pub struct MeterController {
    name: String,
    device: Arc<DeviceContext>,
    pcs: Vec<Arc<dyn RegisterPeer>>,
    loss_ratio: f64,
}

impl MeterController {
    pub fn new(
        name: impl Into<String>,
        device: Arc<DeviceContext>,
        pcs: Vec<Arc<dyn RegisterPeer>>,
        loss_ratio: f64,
    ) -> Self {
        Self {
            name: name.into(),
            device,
            pcs,
            loss_ratio: loss_ratio.clamp(0.0, 1.0),
        }
    }

    pub async fn tick(&mut self) -> Result<MeterTick, DeviceError> {
        let mut sum_kw = 0.0;
        let mut pcs_ok = 0;
        for peer in &self.pcs {
            match read_input(peer.as_ref(), pcs::ACTIVE_POWER).await {
                Ok(raw) => {
                    sum_kw += decode_power_kw(raw);
                    pcs_ok += 1;
                }
                Err(e) => warn!(device = %self.name, peer = %peer.name(), error = %e, "pcs read failed"),
            }
        }

        let active_power_kw = (1.0 - self.loss_ratio) * sum_kw;
        let raw = saturate_power_kw(active_power_kw);
        self.device.input().store(meter::ACTIVE_POWER, raw)?;
        Ok(MeterTick {
            pcs_ok,
            active_power_kw,
        })
    }
}

#[async_trait]
impl Controller for MeterController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&mut self) -> Result<(), DeviceError> {
        let tick = self.tick().await?;
        debug!(device = %self.name, active_power_kw = tick.active_power_kw, "meter tick");
        Ok(())
    }
}
