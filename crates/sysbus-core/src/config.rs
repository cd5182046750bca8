//! Bus configuration with validation.
//!
//! Loaded from TOML:
//!
//! ```toml
//! service_name = "com.example.echo"
//!
//! [permissions]
//! outbound = ["com.example.*"]
//!
//! [timeouts]
//! default_call_timeout_ms = 30000
//! shutdown_drain_ms = 5000
//!
//! [limits]
//! max_payload_bytes = 1048576
//! max_pending_calls = 10000
//! max_frame_bytes = 16777216
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use sysbus_types::FrameCodec;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("Failed to read {path}: {error}")]
    Io { path: String, error: String },

    /// TOML parse error.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Service name empty or containing invalid characters.
    #[error("Invalid service name: {0:?}")]
    InvalidServiceName(String),

    /// The connection is registered under a different name than configured.
    #[error("Connection is named {connected:?} but service_name is {configured:?}")]
    NameMismatch { configured: String, connected: String },

    /// Outbound permission pattern malformed.
    #[error("Invalid permission pattern: {0:?}")]
    InvalidPattern(String),

    /// A timeout that must be positive is zero.
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    /// A limit that must be positive is zero.
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
}

/// Main bus configuration for one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Name this handle registers on the bus.
    pub service_name: String,
    /// Outbound call permissions.
    pub permissions: PermissionsConfig,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Resource limits.
    pub limits: LimitsConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: "com.sysbus.anonymous".to_string(),
            permissions: PermissionsConfig::default(),
            timeouts: TimeoutConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl BusConfig {
    /// Default configuration for a named service.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BusConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_name(&self.service_name)?;

        for pattern in &self.permissions.outbound {
            crate::permissions::ServicePattern::parse(pattern)?;
        }

        if self.timeouts.default_call_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidTimeout(
                "default_call_timeout_ms cannot be 0".into(),
            ));
        }
        if self.timeouts.shutdown_drain_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "shutdown_drain_ms cannot be 0".into(),
            ));
        }

        if self.limits.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_payload_bytes cannot be 0".into(),
            ));
        }
        if self.limits.max_pending_calls == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_pending_calls cannot be 0".into(),
            ));
        }
        if self.limits.max_frame_bytes < self.limits.max_payload_bytes {
            return Err(ConfigError::InvalidLimit(
                "max_frame_bytes must be at least max_payload_bytes".into(),
            ));
        }

        Ok(())
    }
}

/// Service names are dotted identifiers: `com.example.service`.
pub(crate) fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidServiceName(name.to_string()))
    }
}

/// Outbound call permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Destination patterns this service may call: `*`, `prefix.*` or an exact name.
    pub outbound: Vec<String>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            outbound: vec!["*".to_string()],
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout armed on every `call` (not on watches or subscriptions). None disables it.
    pub default_call_timeout_ms: Option<u64>,
    /// Upper bound on flushing the transport during shutdown.
    pub shutdown_drain_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: None,
            shutdown_drain_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    /// Default call timeout as a `Duration`.
    pub fn default_call_timeout(&self) -> Option<Duration> {
        self.default_call_timeout_ms.map(Duration::from_millis)
    }

    /// Shutdown drain bound as a `Duration`.
    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }
}

/// Resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest payload accepted by `call` and `respond`.
    pub max_payload_bytes: usize,
    /// Most outstanding outbound calls per handle.
    pub max_pending_calls: usize,
    /// Largest encoded frame the transport accepts. Applied by transports
    /// built through [`LimitsConfig::frame_codec`].
    pub max_frame_bytes: usize,
}

impl LimitsConfig {
    /// Codec enforcing `max_frame_bytes`.
    #[must_use]
    pub fn frame_codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_bytes)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_pending_calls: 10_000,
            max_frame_bytes: sysbus_types::frame::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
