use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::layout::{bms, pcs, pms};
use super::{read_input, Controller};
use crate::error::DeviceError;
use crate::modbus::RegisterPeer;
use crate::registers::DeviceContext;
use crate::scaling::{
    decode_energy_kwh, decode_percent, decode_power_kw, encode_energy_kwh, encode_percent,
    encode_power_kw, saturate_power_kw,
};

/// A PCS under plant control and the battery behind it.
pub struct PcsLink {
    pub pcs: Arc<dyn RegisterPeer>,
    pub bms: Option<Arc<dyn RegisterPeer>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmsTick {
    pub demand_kw: f64,
    pub setpoint_kw: f64,
    pub total_active_power_kw: f64,
    /// PCS whose active power was read this tick.
    pub pcs_ok: usize,
    /// BMS that answered this tick.
    pub bms_ok: usize,
    /// `None` when no BMS answered; the published value is left as is.
    pub soc_avg: Option<f64>,
    pub soh_avg: Option<f64>,
    pub capacity_total_kwh: f64,
}

/// Plant Management System: splits demand across PCS and publishes plant
/// aggregates.
pub struct PmsController {
    name: String,
    device: Arc<DeviceContext>,
    links: Vec<PcsLink>,
}

#[derive(Default)]
struct BatteryTotals {
    responded: usize,
    soc: f64,
    soh: f64,
    capacity_kwh: f64,
}

impl PmsController {
    pub fn new(name: impl Into<String>, device: Arc<DeviceContext>, links: Vec<PcsLink>) -> Self {
        Self {
            name: name.into(),
            device,
            links,
        }
    }

    pub async fn tick(&mut self) -> Result<PmsTick, DeviceError> {
        let demand_kw = decode_power_kw(self.device.holding().read_one(pms::DEMAND_CONTROL_POWER)?);
        let setpoint_kw = if self.links.is_empty() {
            0.0
        } else {
            demand_kw / self.links.len() as f64
        };
        let setpoint = encode_power_kw(setpoint_kw).map_err(|source| DeviceError::Encode {
            name: "power_setpoint",
            source,
        })?;

        let mut total_active_power_kw = 0.0;
        let mut pcs_ok = 0;
        let mut batteries = BatteryTotals::default();

        for link in &self.links {
            if let Some(kw) = self.drive_pcs(link.pcs.as_ref(), setpoint).await {
                total_active_power_kw += kw;
                pcs_ok += 1;
            }
            if let Some(peer) = &link.bms {
                self.poll_bms(peer.as_ref(), &mut batteries).await;
            }
        }

        let (soc_avg, soh_avg) = if batteries.responded > 0 {
            let n = batteries.responded as f64;
            (Some(batteries.soc / n), Some(batteries.soh / n))
        } else {
            (None, None)
        };

        let tick = PmsTick {
            demand_kw,
            setpoint_kw,
            total_active_power_kw,
            pcs_ok,
            bms_ok: batteries.responded,
            soc_avg,
            soh_avg,
            capacity_total_kwh: batteries.capacity_kwh,
        };
        self.publish(&tick)?;
        Ok(tick)
    }

    /// Write the setpoint, then read back what the PCS actually delivers.
    async fn drive_pcs(&self, peer: &dyn RegisterPeer, setpoint: u16) -> Option<f64> {
        if let Err(e) = peer.write_single_register(pcs::POWER_SETPOINT, setpoint).await {
            warn!(device = %self.name, peer = %peer.name(), error = %e, "setpoint write failed");
        }
        match read_input(peer, pcs::ACTIVE_POWER).await {
            Ok(raw) => Some(decode_power_kw(raw)),
            Err(e) => {
                warn!(device = %self.name, peer = %peer.name(), error = %e, "pcs read failed");
                None
            }
        }
    }

    async fn poll_bms(&self, peer: &dyn RegisterPeer, totals: &mut BatteryTotals) {
        match peer.read_input_registers(bms::SOC, bms::STATUS_LEN).await {
            Ok(words) if words.len() == bms::STATUS_LEN as usize => {
                totals.responded += 1;
                totals.soc += decode_percent(words[0]);
                totals.soh += decode_percent(words[1]);
                totals.capacity_kwh += decode_energy_kwh(words[2]);
            }
            Ok(words) => {
                warn!(device = %self.name, peer = %peer.name(), len = words.len(), "short bms status")
            }
            Err(e) => warn!(device = %self.name, peer = %peer.name(), error = %e, "bms read failed"),
        }
    }

    /// All aggregates land under one device lock so a reader never sees a
    /// mix of two ticks.
    fn publish(&self, tick: &PmsTick) -> Result<(), DeviceError> {
        // Rounded setpoints can sum past the word range at maximum demand.
        let total = saturate_power_kw(tick.total_active_power_kw);

        let _batch = self.device.lock();
        let input = self.device.input();
        input.store(pms::TOTAL_ACTIVE_POWER, total)?;
        if let Some(soc) = tick.soc_avg {
            input.store(pms::SOC_AVG, encode_percent(soc))?;
        }
        if let Some(soh) = tick.soh_avg {
            input.store(pms::SOH_AVG, encode_percent(soh))?;
        }
        input.store(pms::CAPACITY_TOTAL, encode_energy_kwh(tick.capacity_total_kwh))?;
        Ok(())
    }
}

#[async_trait]
impl Controller for PmsController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&mut self) -> Result<(), DeviceError> {
        let tick = self.tick().await?;
        info!(
            device = %self.name,
            demand_kw = tick.demand_kw,
            total_active_power_kw = tick.total_active_power_kw,
            soc_avg = tick.soc_avg,
            capacity_total_kwh = tick.capacity_total_kwh,
            pcs_ok = tick.pcs_ok,
            bms_ok = tick.bms_ok,
            "plant tick"
        );
        Ok(())
    }
}
