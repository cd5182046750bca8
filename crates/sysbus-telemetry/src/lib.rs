//! # Sysbus Telemetry
//!
//! Structured logging for sysbus services.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sysbus_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SYSBUS_SERVICE_NAME` | `sysbus` | Service name in log lines |
//! | `SYSBUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter |
//! | `SYSBUS_JSON_LOGS` | `false` | JSON output (default on in containers) |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging, init_test_logging};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}
