//! # Transport Boundary
//!
//! The core needs four things from a transport: send a message to a named
//! endpoint, flush what has been sent, close the connection, and a stream of
//! inbound messages. Everything else (sockets, discovery, security) lives
//! behind this trait.

mod local;

pub use local::{LocalBus, LocalTransport};

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use sysbus_types::{BusError, FrameError, Message};
use tokio_stream::Stream;

/// Outbound half of a bus connection.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Name this endpoint is reachable under.
    fn local_name(&self) -> &str;

    /// Send `message` to the endpoint named `destination`.
    ///
    /// Returns `TransportUnavailable` when the peer cannot be reached.
    fn send(&self, destination: &str, message: &Message) -> Result<(), BusError>;

    /// Wait until everything passed to `send` has left this process.
    async fn flush(&self) -> Result<(), BusError>;

    /// Release the endpoint. Peers see further sends to it fail.
    async fn close(&self);
}

/// Inbound half of a bus connection. Ends when the connection is lost.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Message, FrameError>> + Send>>;

/// An established connection, handed to a `Handle` at startup.
pub struct Connection {
    /// Outbound half.
    pub transport: Arc<dyn Transport>,
    /// Inbound half.
    pub inbound: InboundStream,
}

impl Connection {
    /// Pair a transport with its inbound stream.
    pub fn new(transport: Arc<dyn Transport>, inbound: InboundStream) -> Self {
        Self { transport, inbound }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
