//! Method registry: (category, name) to handler.

use crate::request::Request;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use sysbus_types::{BusError, MethodKey};

/// Handles requests for one registered method.
///
/// Handlers run on the dispatcher and must not block. Long-running work is
/// deferred with [`Request::schedule`] or spawned. An `Err` (or a panic) is
/// logged and answered with an internal-error response if the request has not
/// been finished yet.
pub trait MethodHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> anyhow::Result<()>;
}

impl<F> MethodHandler for F
where
    F: Fn(Request) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> anyhow::Result<()> {
        self(request)
    }
}

/// Registered methods of one handle.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<MethodKey, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`.
    ///
    /// Fails with `DuplicateMethod` if the key is taken; the first handler stays.
    pub fn register(&mut self, key: MethodKey, handler: Arc<dyn MethodHandler>) -> Result<(), BusError> {
        if self.methods.contains_key(&key) {
            return Err(BusError::DuplicateMethod {
                category: key.category().to_string(),
                method: key.name().to_string(),
            });
        }
        self.methods.insert(key, handler);
        Ok(())
    }

    /// Remove `key`. Returns whether it was registered.
    pub fn unregister(&mut self, key: &MethodKey) -> bool {
        self.methods.remove(key).is_some()
    }

    pub fn lookup(&self, key: &MethodKey) -> Result<Arc<dyn MethodHandler>, BusError> {
        self.methods
            .get(key)
            .cloned()
            .ok_or_else(|| BusError::MethodNotFound {
                category: key.category().to_string(),
                method: key.name().to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, key: &MethodKey) -> bool {
        self.methods.contains_key(key)
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<MethodKey> {
        let mut keys: Vec<MethodKey> = self.methods.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}
