use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use plant_sim::{config::Config, plant::Plant, telemetry};
use tracing::info;

/// Simulated PMS / PCS / BMS fleet speaking Modbus TCP.
#[derive(Debug, Parser)]
#[command(name = "plant-sim", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "PLANT_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Launch only this device; repeat for several. Default: all devices.
    #[arg(short, long = "device", value_name = "NAME")]
    devices: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    telemetry::init_tracing(cfg.log_format);

    info!(
        devices = cfg.devices.len(),
        tick_interval_ms = cfg.plant.tick_interval_ms,
        faults = !cfg.faults.is_disabled(),
        "starting plant simulator"
    );

    let plant = Plant::launch(&cfg, &cli.devices).await?;
    telemetry::shutdown_signal().await;
    plant.shutdown().await;
    Ok(())
}
