//! Shared test fixtures.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sysbus_core::{
    BusConfig, BusError, Handle, InboundStream, LocalBus, Message, Payload, Transport,
};
use tokio_stream::StreamExt;
use tracing::warn;

pub const ECHO_SERVICE: &str = "com.example.echo";
pub const CLIENT: &str = "com.example.client";
pub const PEER: &str = "com.example.peer";

/// Spawn a handle named `name` with default configuration.
pub fn spawn(bus: &LocalBus, name: &str) -> Result<Handle> {
    sysbus_telemetry::init_test_logging();
    Ok(Handle::spawn(BusConfig::new(name), bus.connect(name)?)?)
}

/// A service answering `test` with `{msg: "echo request: <msg>"}` and
/// panicking in `boom`.
pub async fn echo_service(bus: &LocalBus) -> Result<Handle> {
    let service = spawn(bus, ECHO_SERVICE)?;
    service
        .register_method("", "test", |request| {
            let body: serde_json::Value = request.payload().parse_json()?;
            let msg = body["msg"].as_str().unwrap_or_default();
            request.respond(json!({ "msg": format!("echo request: {msg}") }))?;
            Ok(())
        })
        .await?;
    service
        .register_method("", "boom", |_request| panic!("boom handler exploded"))
        .await?;
    Ok(service)
}

/// Poll `sample` until it yields `expected` or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, expected: usize, mut sample: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = usize>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if sample().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    sample().await == expected
}

/// A bare endpoint that speaks frames directly, for scripting peer
/// behaviour a [`Handle`] would never produce.
pub struct RawPeer {
    name: String,
    transport: Arc<dyn Transport>,
    inbound: InboundStream,
}

impl RawPeer {
    pub fn connect(bus: &LocalBus, name: &str) -> Result<Self> {
        let connection = bus.connect(name)?;
        Ok(Self {
            name: name.to_string(),
            transport: connection.transport,
            inbound: connection.inbound,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next decoded message; `None` once disconnected.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.inbound.next().await? {
                Ok(message) => return Some(message),
                Err(e) => warn!(peer = %self.name, error = %e, "Undecodable frame"),
            }
        }
    }

    /// Next message within one second.
    pub async fn expect(&mut self) -> Result<Message> {
        tokio::time::timeout(Duration::from_secs(1), self.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("peer {} disconnected", self.name))
    }

    /// Answer `request`.
    pub fn respond(
        &self,
        request: &Message,
        payload: impl Into<Payload>,
        last: bool,
    ) -> Result<(), BusError> {
        let response = Message::response_to(request, payload.into(), last);
        self.transport.send(request.sender(), &response)
    }
}
