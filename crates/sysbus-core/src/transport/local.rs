//! In-memory bus hub.
//!
//! Every endpoint owns an unbounded queue of encoded frames. Messages are
//! framed with [`FrameCodec`] on send and decoded on receipt, so the full wire
//! path is exercised even in a single process.

use super::{Connection, Transport};
use crate::config::LimitsConfig;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysbus_types::{BusError, FrameCodec, Message};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

struct Endpoint {
    id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
}

/// In-memory hub connecting named endpoints within one process.
#[derive(Clone)]
pub struct LocalBus {
    endpoints: Arc<RwLock<HashMap<String, Endpoint>>>,
    next_id: Arc<AtomicU64>,
    codec: FrameCodec,
}

impl LocalBus {
    /// Create a hub with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(FrameCodec::default())
    }

    /// Create a hub that frames with `codec`.
    #[must_use]
    pub fn with_codec(codec: FrameCodec) -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            codec,
        }
    }

    /// Create a hub enforcing `limits.max_frame_bytes`.
    #[must_use]
    pub fn with_limits(limits: &LimitsConfig) -> Self {
        Self::with_codec(limits.frame_codec())
    }

    /// Register `name` and return its connection.
    ///
    /// Fails with `NameInUse` if another endpoint holds the name.
    pub fn connect(&self, name: &str) -> Result<Connection, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut endpoints = self.endpoints.write();
            if endpoints.contains_key(name) {
                return Err(BusError::NameInUse(name.to_string()));
            }
            endpoints.insert(name.to_string(), Endpoint { id, sender });
        }

        debug!(endpoint = %name, "Endpoint connected");

        let codec = self.codec;
        let inbound = UnboundedReceiverStream::new(receiver).map(move |frame| codec.decode(&frame));
        let transport = LocalTransport {
            name: name.to_string(),
            id,
            bus: self.clone(),
        };
        Ok(Connection::new(Arc::new(transport), Box::pin(inbound)))
    }

    /// Drop `name` from the hub abruptly.
    ///
    /// The endpoint's inbound stream ends and sends to it fail. Returns false
    /// if the name was not connected.
    pub fn disconnect(&self, name: &str) -> bool {
        let removed = self.endpoints.write().remove(name).is_some();
        if removed {
            debug!(endpoint = %name, "Endpoint disconnected");
        }
        removed
    }

    /// Whether `name` is currently connected.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.endpoints.read().contains_key(name)
    }

    /// Names of all connected endpoints, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn is_current(&self, name: &str, id: u64) -> bool {
        self.endpoints
            .read()
            .get(name)
            .is_some_and(|endpoint| endpoint.id == id)
    }

    fn remove_if_current(&self, name: &str, id: u64) -> bool {
        let mut endpoints = self.endpoints.write();
        if endpoints.get(name).is_some_and(|endpoint| endpoint.id == id) {
            endpoints.remove(name);
            return true;
        }
        false
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

/// One endpoint's outbound half on a [`LocalBus`].
pub struct LocalTransport {
    name: String,
    id: u64,
    bus: LocalBus,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_name(&self) -> &str {
        &self.name
    }

    fn send(&self, destination: &str, message: &Message) -> Result<(), BusError> {
        if !self.bus.is_current(&self.name, self.id) {
            return Err(BusError::Disconnected);
        }

        let frame = self.bus.codec.encode(message)?;
        let endpoints = self.bus.endpoints.read();
        let endpoint = endpoints
            .get(destination)
            .ok_or_else(|| BusError::transport_unavailable(destination, "no such endpoint"))?;
        endpoint
            .sender
            .send(frame)
            .map_err(|_| BusError::transport_unavailable(destination, "endpoint closed"))
    }

    async fn flush(&self) -> Result<(), BusError> {
        // Frames are queued at the receiver as soon as `send` returns.
        Ok(())
    }

    async fn close(&self) {
        if self.bus.remove_if_current(&self.name, self.id) {
            debug!(endpoint = %self.name, "Endpoint closed");
        }
    }
}
