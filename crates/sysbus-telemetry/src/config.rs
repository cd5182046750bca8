//! Telemetry configuration from environment variables.

use std::env;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every log line.
    pub service_name: String,

    /// Log filter directive (`info`, `sysbus_core=debug,warn`, ...)
    pub log_level: String,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Whether to colour pretty output
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sysbus".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SYSBUS_SERVICE_NAME`: Service name (default: sysbus)
    /// - `SYSBUS_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `SYSBUS_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    /// - `NO_COLOR`: Disable ANSI colours when set
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let is_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();

        Self {
            service_name: lookup("SYSBUS_SERVICE_NAME").unwrap_or(defaults.service_name),

            log_level: lookup("SYSBUS_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            json_logs: lookup("SYSBUS_JSON_LOGS")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(is_container),

            ansi: lookup("NO_COLOR").is_none(),
        }
    }

    /// Configuration for a named service, other fields from the environment.
    pub fn for_service(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::from_env()
        }
    }
}
