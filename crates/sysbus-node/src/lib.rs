//! # Sysbus Node
//!
//! Demo wiring for the bus: a service and a client sharing one in-process
//! [`LocalBus`]. The binary in `main.rs` runs [`run_demo`]; the pieces are
//! exposed here for tests.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod client;
pub mod service;

pub use client::{run_client, DemoReport, DELAY_RESPONSE_TIMEOUT};
pub use service::register_demo_methods;

use anyhow::{Context, Result};
use std::path::Path;
use sysbus_core::{BusConfig, Handle, LocalBus};
use tracing::info;

/// Bus name of the demo service.
pub const SERVICE_NAME: &str = "com.sysbus.demo.service";

/// Bus name of the demo client.
pub const CLIENT_NAME: &str = "com.sysbus.demo.client";

/// Environment variable naming a TOML file with the service configuration.
pub const CONFIG_ENV: &str = "SYSBUS_CONFIG";

/// Load the service configuration.
///
/// Reads the file named by `SYSBUS_CONFIG` when set, otherwise uses defaults
/// for [`SERVICE_NAME`].
pub fn load_service_config() -> Result<BusConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => load_service_config_from(Path::new(&path)),
        None => Ok(BusConfig::new(SERVICE_NAME)),
    }
}

/// Load the service configuration from `path`.
pub fn load_service_config_from(path: &Path) -> Result<BusConfig> {
    let config = BusConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!(path = %path.display(), service = %config.service_name, "Loaded configuration");
    Ok(config)
}

/// In-process bus framing with the limits from `config`.
#[must_use]
pub fn bus_for(config: &BusConfig) -> LocalBus {
    LocalBus::with_limits(&config.limits)
}

/// Client configuration: may only call the demo service.
#[must_use]
pub fn client_config(service_name: &str) -> BusConfig {
    let mut config = BusConfig::new(CLIENT_NAME);
    config.permissions.outbound = vec![service_name.to_string()];
    config
}

/// Start the demo service on `bus`.
pub async fn start_service(bus: &LocalBus, config: BusConfig) -> Result<Handle> {
    let connection = bus
        .connect(&config.service_name)
        .context("Failed to connect service")?;
    let handle = Handle::spawn(config, connection)?;
    register_demo_methods(&handle).await?;
    Ok(handle)
}

/// Run the service and the client to completion.
///
/// Returns the client's report after the service has shut itself down.
pub async fn run_demo(bus: &LocalBus, service_config: BusConfig) -> Result<DemoReport> {
    let service = start_service(bus, service_config).await?;

    let client_config = client_config(service.service_name());
    let connection = bus
        .connect(&client_config.service_name)
        .context("Failed to connect client")?;
    let client = Handle::spawn(client_config, connection)?;

    let report = run_client(&client, service.service_name()).await?;

    service.closed().await;
    info!(service = %service.service_name(), "Service exited");

    client.shutdown().await;
    Ok(report)
}
