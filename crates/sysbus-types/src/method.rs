//! # Method Addressing
//!
//! A method is addressed by `(category, name)` inside a service. Callers name a
//! remote method with a URI such as `luna://com.example.service/category/method`.

use crate::errors::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The root category, used when a method is registered without one.
pub const ROOT_CATEGORY: &str = "/";

/// URI schemes accepted in destinations.
const SCHEMES: [&str; 2] = ["luna://", "palm://"];

/// Registry key of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    category: String,
    name: String,
}

impl MethodKey {
    /// Build a key, normalising the category to start with `/`.
    ///
    /// An empty category becomes the root category.
    pub fn new(category: impl AsRef<str>, name: impl Into<String>) -> Self {
        let category = category.as_ref().trim_end_matches('/');
        let category = if category.is_empty() {
            ROOT_CATEGORY.to_string()
        } else if category.starts_with('/') {
            category.to_string()
        } else {
            format!("/{category}")
        };
        Self {
            category,
            name: name.into(),
        }
    }

    /// The category, always starting with `/`.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// The method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category == ROOT_CATEGORY {
            write!(f, "/{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// A parsed call destination: target service plus method key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    service: String,
    method: MethodKey,
}

impl Destination {
    /// Build a destination from parts.
    pub fn new(service: impl Into<String>, method: MethodKey) -> Self {
        Self {
            service: service.into(),
            method,
        }
    }

    /// Parse `scheme://service/category.../method`.
    ///
    /// The scheme is optional. Everything between the service name and the last
    /// path segment is the category.
    pub fn parse(uri: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidDestination(uri.to_string());

        let rest = SCHEMES
            .iter()
            .find_map(|scheme| uri.strip_prefix(scheme))
            .unwrap_or(uri);
        if rest.contains("://") {
            return Err(invalid());
        }

        let (service, path) = rest.split_once('/').ok_or_else(invalid)?;
        if service.is_empty() {
            return Err(invalid());
        }

        let (category, name) = match path.rsplit_once('/') {
            Some((category, name)) => (category, name),
            None => ("", path),
        };
        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(service, MethodKey::new(category, name)))
    }

    /// Target service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Target method.
    #[must_use]
    pub fn method(&self) -> &MethodKey {
        &self.method
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "luna://{}{}", self.service, self.method)
    }
}
