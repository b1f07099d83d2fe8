use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::layout::{bms, pcs};
use super::{read_input, Controller};
use crate::error::DeviceError;
use crate::modbus::RegisterPeer;
use crate::registers::DeviceContext;
use crate::scaling::{decode_energy_kwh, decode_percent, decode_power_kw, encode_percent};

/// Integrate SOC over `dt_s` seconds at `power_kw` (positive discharges).
/// A battery without capacity does not move.
pub fn integrate_soc(soc_percent: f64, power_kw: f64, dt_s: f64, capacity_kwh: f64) -> f64 {
    if capacity_kwh <= 0.0 || dt_s <= 0.0 {
        return soc_percent.clamp(0.0, 100.0);
    }
    let delta = -(power_kw * dt_s) / (capacity_kwh * 3600.0) * 100.0;
    (soc_percent + delta).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BmsTick {
    pub power_kw: f64,
    pub dt_s: f64,
    pub soc_percent: f64,
}

/// Battery Management System: integrates the paired PCS's power into SOC.
///
/// SOC is tracked at full precision between ticks and only rounded when
/// published, so sub-percent changes accumulate.
pub struct BmsController {
    name: String,
    device: Arc<DeviceContext>,
    pcs: Option<Arc<dyn RegisterPeer>>,
    soc: Option<f64>,
    last_tick: Option<Instant>,
}

impl BmsController {
    pub fn new(
        name: impl Into<String>,
        device: Arc<DeviceContext>,
        pcs: Option<Arc<dyn RegisterPeer>>,
    ) -> Self {
        Self {
            name: name.into(),
            device,
            pcs,
            soc: None,
            last_tick: None,
        }
    }

    pub async fn tick(&mut self) -> Result<BmsTick, DeviceError> {
        self.tick_at(Instant::now()).await
    }

    /// Tick as if the clock read `now`. The first tick only seeds the
    /// accumulator from the published register.
    pub async fn tick_at(&mut self, now: Instant) -> Result<BmsTick, DeviceError> {
        let power_kw = match &self.pcs {
            Some(peer) => match read_input(peer.as_ref(), pcs::ACTIVE_POWER).await {
                Ok(raw) => decode_power_kw(raw),
                Err(e) => {
                    warn!(device = %self.name, peer = %peer.name(), error = %e, "pcs unreachable, assuming idle");
                    0.0
                }
            },
            None => 0.0,
        };

        let dt_s = self
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        let input = self.device.input();
        let soc = match self.soc {
            Some(soc) => soc,
            None => decode_percent(input.read_one(bms::SOC)?),
        };
        let capacity_kwh = decode_energy_kwh(input.read_one(bms::CAPACITY)?);

        let soc = integrate_soc(soc, power_kw, dt_s, capacity_kwh);
        self.soc = Some(soc);
        input.store(bms::SOC, encode_percent(soc))?;

        Ok(BmsTick {
            power_kw,
            dt_s,
            soc_percent: soc,
        })
    }
}

#[async_trait]
impl Controller for BmsController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&mut self) -> Result<(), DeviceError> {
        let tick = self.tick().await?;
        debug!(
            device = %self.name,
            power_kw = tick.power_kw,
            dt_s = tick.dt_s,
            soc_percent = tick.soc_percent,
            "bms tick"
        );
        Ok(())
    }
}
