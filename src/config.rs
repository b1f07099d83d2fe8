use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use validator::Validate;

use crate::devices::DeviceKind;
use crate::faults::FaultProfile;
use crate::modbus::ClientSettings;
use crate::telemetry::LogFormat;

pub const DEFAULT_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "PLANT_SIM__";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    #[validate(nested)]
    pub plant: PlantConfig,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    #[validate(nested)]
    pub faults: FaultProfile,
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
    /// PCS name -> BMS name.
    #[serde(default)]
    pub pairing: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct PlantConfig {
    pub host: String,
    #[validate(range(min = 10))]
    pub tick_interval_ms: u64,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            tick_interval_ms: 1000,
        }
    }
}

impl PlantConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    pub port: u16,
    pub unit_id: u8,
    /// Overrides the plant-wide profile for this device's listener.
    #[validate(nested)]
    pub faults: Option<FaultProfile>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soc: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soh: Option<f64>,
    #[validate(range(min = 0.0))]
    pub capacity_kwh: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub loss_ratio: Option<f64>,
}

impl DeviceConfig {
    /// Physical start values for the named registers of this device.
    pub fn initial_values(&self) -> Vec<(&'static str, f64)> {
        match self.kind {
            DeviceKind::Bms => vec![
                ("soc", self.initial_soc.unwrap_or(50.0)),
                ("soh", self.initial_soh.unwrap_or(100.0)),
                ("capacity", self.capacity_kwh.unwrap_or(100.0)),
            ],
            DeviceKind::Pms | DeviceKind::Pcs | DeviceKind::Meter => Vec::new(),
        }
    }

    pub fn loss_ratio(&self) -> f64 {
        self.loss_ratio.unwrap_or(0.02)
    }
}

impl Config {
    /// Load `path` (or the default file) layered under `PLANT_SIM__*`
    /// environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_PATH));
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let cfg: Config = figment
            .extract()
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Field ranges plus the plant topology rules.
    pub fn check(&self) -> Result<()> {
        self.validate().context("invalid configuration")?;

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                bail!("duplicate device name {}", device.name);
            }
            if device.port != 0 && !ports.insert(device.port) {
                bail!("duplicate port {} ({})", device.port, device.name);
            }
        }

        let pms = self.devices.iter().filter(|d| d.kind == DeviceKind::Pms).count();
        if pms > 1 {
            bail!("at most one pms allowed, found {pms}");
        }

        let mut paired_bms = HashSet::new();
        for (pcs, bms) in &self.pairing {
            match self.device(pcs) {
                Some(d) if d.kind == DeviceKind::Pcs => {}
                _ => bail!("pairing key {pcs} is not a configured pcs"),
            }
            match self.device(bms) {
                Some(d) if d.kind == DeviceKind::Bms => {}
                _ => bail!("{pcs} is paired with {bms}, which is not a configured bms"),
            }
            if !paired_bms.insert(bms.as_str()) {
                bail!("bms {bms} is paired with more than one pcs");
            }
        }
        for pcs in self.devices_of(DeviceKind::Pcs) {
            if !self.pairing.contains_key(&pcs.name) {
                bail!("pcs {} has no paired bms", pcs.name);
            }
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn devices_of(&self, kind: DeviceKind) -> impl Iterator<Item = &DeviceConfig> + '_ {
        self.devices.iter().filter(move |d| d.kind == kind)
    }

    /// The PCS feeding `bms`, if any.
    pub fn pcs_for(&self, bms: &str) -> Option<&DeviceConfig> {
        self.pairing
            .iter()
            .find(|(_, b)| b.as_str() == bms)
            .and_then(|(pcs, _)| self.device(pcs))
    }

    pub fn bms_for(&self, pcs: &str) -> Option<&DeviceConfig> {
        self.pairing.get(pcs).and_then(|bms| self.device(bms))
    }
}
