//! # Sysbus Node
//!
//! Runs the demo service and client on an in-process bus.
//!
//! ## Environment
//!
//! - `SYSBUS_CONFIG`: TOML file with the service's bus configuration
//! - `SYSBUS_LOG_LEVEL` / `RUST_LOG`: log filter
//! - `SYSBUS_JSON_LOGS`: JSON log output

use anyhow::{Context, Result};
use sysbus_node::{bus_for, load_service_config, run_demo};
use sysbus_telemetry::{init_logging, TelemetryConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::for_service("sysbus-node");
    init_logging(&telemetry).context("Failed to initialize logging")?;

    let config = load_service_config()?;
    config.validate().context("Invalid service configuration")?;

    info!("===========================================");
    info!("  Sysbus demo node");
    info!("  Service: {}", config.service_name);
    info!("===========================================");

    let bus = bus_for(&config);

    info!("Demo is running. Press Ctrl+C to stop.");
    tokio::select! {
        report = run_demo(&bus, config) => {
            let report = report?;
            info!(
                echo = %report.echo,
                delayed = report.delayed.len(),
                timeouts = report.timeouts(),
                farewell = report.farewell.len(),
                "Demo finished"
            );
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            warn!(endpoints = ?bus.endpoints(), "Interrupted, closing endpoints");
            for name in bus.endpoints() {
                bus.disconnect(&name);
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}
