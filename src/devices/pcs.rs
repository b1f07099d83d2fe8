use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::layout::{bms, pcs};
use super::{read_input, Controller};
use crate::error::DeviceError;
use crate::modbus::RegisterPeer;
use crate::registers::DeviceContext;
use crate::scaling::{decode_percent, decode_power_kw, encode_power_kw};

/// SOC assumed before the paired battery has ever answered.
pub const NEUTRAL_SOC_PERCENT: f64 = 50.0;

/// Output power for a setpoint given the battery's SOC.
///
/// Positive is discharge. An empty battery refuses to discharge and a full
/// one refuses to charge; everything else passes through.
pub fn limit_power(setpoint_kw: f64, soc_percent: f64) -> f64 {
    if soc_percent <= 0.0 && setpoint_kw > 0.0 {
        0.0
    } else if soc_percent >= 100.0 && setpoint_kw < 0.0 {
        0.0
    } else {
        setpoint_kw
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcsTick {
    pub setpoint_kw: f64,
    pub soc_percent: f64,
    /// False when the SOC came from the fallback instead of the battery.
    pub soc_fresh: bool,
    pub active_power_kw: f64,
}

/// Power Conversion Station: follows its setpoint within the limits of the
/// paired battery and publishes the resulting active power.
pub struct PcsController {
    name: String,
    device: Arc<DeviceContext>,
    bms: Option<Arc<dyn RegisterPeer>>,
    last_soc: f64,
}

impl PcsController {
    pub fn new(
        name: impl Into<String>,
        device: Arc<DeviceContext>,
        bms: Option<Arc<dyn RegisterPeer>>,
    ) -> Self {
        Self {
            name: name.into(),
            device,
            bms,
            last_soc: NEUTRAL_SOC_PERCENT,
        }
    }

    pub async fn tick(&mut self) -> Result<PcsTick, DeviceError> {
        let setpoint_kw = decode_power_kw(self.device.holding().read_one(pcs::POWER_SETPOINT)?);

        let mut soc_fresh = false;
        if let Some(peer) = &self.bms {
            match read_input(peer.as_ref(), bms::SOC).await {
                Ok(raw) => {
                    self.last_soc = decode_percent(raw);
                    soc_fresh = true;
                }
                Err(e) => warn!(
                    device = %self.name,
                    peer = %peer.name(),
                    error = %e,
                    fallback_soc = self.last_soc,
                    "bms unreachable, using last known soc"
                ),
            }
        }

        let active_power_kw = limit_power(setpoint_kw, self.last_soc);
        let raw = encode_power_kw(active_power_kw).map_err(|source| DeviceError::Encode {
            name: "active_power",
            source,
        })?;
        self.device.input().store(pcs::ACTIVE_POWER, raw)?;

        Ok(PcsTick {
            setpoint_kw,
            soc_percent: self.last_soc,
            soc_fresh,
            active_power_kw,
        })
    }
}

#[async_trait]
impl Controller for PcsController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&mut self) -> Result<(), DeviceError> {
        let tick = self.tick().await?;
        debug!(
            device = %self.name,
            setpoint_kw = tick.setpoint_kw,
            soc_percent = tick.soc_percent,
            active_power_kw = tick.active_power_kw,
            "pcs tick"
        );
        Ok(())
    }
}
