//! Outbound call permissions.
//!
//! A handle consults its [`AccessPolicy`] before anything is sent. The stock
//! policy, [`OutboundPermissions`], matches destination service names against
//! configured patterns:
//!
//! - `*` allows every service
//! - `com.example.*` allows `com.example` and every service below it
//! - `com.example.echo` allows exactly that service

use crate::config::ConfigError;
use std::fmt;

/// Decides which services a handle may call.
pub trait AccessPolicy: Send + Sync + fmt::Debug {
    /// Whether calls to `service` are allowed.
    fn can_call(&self, service: &str) -> bool;
}

/// One parsed outbound pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePattern {
    /// `*`
    Any,
    /// `prefix.*`
    Prefix(String),
    /// Exact service name.
    Exact(String),
}

impl ServicePattern {
    /// Parse a pattern from configuration.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Ok(Self::Any);
        }

        let invalid = || ConfigError::InvalidPattern(pattern.to_string());
        if let Some(prefix) = pattern.strip_suffix(".*") {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(invalid());
            }
            crate::config::validate_service_name(prefix).map_err(|_| invalid())?;
            return Ok(Self::Prefix(prefix.to_string()));
        }

        if pattern.contains('*') {
            return Err(invalid());
        }
        crate::config::validate_service_name(pattern).map_err(|_| invalid())?;
        Ok(Self::Exact(pattern.to_string()))
    }

    /// Whether `service` matches this pattern.
    #[must_use]
    pub fn matches(&self, service: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(name) => name == service,
            Self::Prefix(prefix) => {
                service == prefix
                    || service
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            }
        }
    }
}

/// Pattern-list policy built from `permissions.outbound`.
#[derive(Debug, Clone, Default)]
pub struct OutboundPermissions {
    patterns: Vec<ServicePattern>,
}

impl OutboundPermissions {
    /// Build from configured pattern strings.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| ServicePattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Policy allowing every destination.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            patterns: vec![ServicePattern::Any],
        }
    }

    /// Policy denying every destination.
    #[must_use]
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Parsed patterns.
    #[must_use]
    pub fn patterns(&self) -> &[ServicePattern] {
        &self.patterns
    }
}

impl AccessPolicy for OutboundPermissions {
    fn can_call(&self, service: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(service))
    }
}
