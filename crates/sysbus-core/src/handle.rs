//! # Handle
//!
//! A process's endpoint on the bus and the single public API surface.
//!
//! `Handle` values are cheap clones that talk to one dispatcher task. Pass
//! them explicitly to whatever needs the bus; there is no global instance.
//!
//! ```no_run
//! use sysbus_core::{BusConfig, Handle, LocalBus};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let bus = LocalBus::new();
//! let service = Handle::spawn(
//!     BusConfig::new("com.example.echo"),
//!     bus.connect("com.example.echo")?,
//! )?;
//! service
//!     .register_method("/", "test", |request| {
//!         request.respond(request.payload().clone())?;
//!         Ok(())
//!     })
//!     .await?;
//!
//! let client = Handle::spawn(
//!     BusConfig::new("com.example.client"),
//!     bus.connect("com.example.client")?,
//! )?;
//! let mut call = client.call("luna://com.example.echo/test", "hello").await?;
//! let reply = call.next_response().await;
//! # Ok(())
//! # }
//! ```

use crate::call::CallHandle;
use crate::config::{BusConfig, ConfigError, LimitsConfig};
use crate::dispatcher::{BusStats, CancelListener, Command, Dispatcher};
use crate::permissions::{AccessPolicy, OutboundPermissions};
use crate::registry::MethodHandler;
use crate::request::Request;
use crate::timer::Task;
use crate::tracker::CallKind;
use crate::transport::Connection;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use sysbus_types::{BusError, Destination, Message, MethodKey, Payload, Token};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Whether a handle can still talk to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

struct HandleInner {
    service_name: String,
    commands: mpsc::UnboundedSender<Command>,
    policy: Arc<dyn AccessPolicy>,
    limits: LimitsConfig,
    state: watch::Receiver<ConnectionState>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // The dispatcher holds its own sender, so the queue never closes on
        // its own. The last clone going away is a shutdown request.
        if self.commands.send(Command::Shutdown).is_ok() {
            debug!(service = %self.service_name, "Last handle dropped, shutting down");
        }
    }
}

/// Bus endpoint for one service identity.
///
/// Dropping the last clone shuts the dispatcher down as if
/// [`Handle::request_shutdown`] had been called. A handler that captures a
/// clone keeps the handle alive until it is shut down explicitly.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Start a handle on `connection`, using `permissions.outbound` from
    /// `config` as the access policy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: BusConfig, connection: Connection) -> Result<Self, ConfigError> {
        let policy = OutboundPermissions::from_patterns(&config.permissions.outbound)?;
        Self::spawn_with_policy(config, connection, Arc::new(policy))
    }

    /// Start a handle with a custom access policy.
    pub fn spawn_with_policy(
        config: BusConfig,
        connection: Connection,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let connected = connection.transport.local_name();
        if connected != config.service_name {
            return Err(ConfigError::NameMismatch {
                configured: config.service_name.clone(),
                connected: connected.to_string(),
            });
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let inner = Arc::new(HandleInner {
            service_name: config.service_name.clone(),
            commands: command_tx.clone(),
            policy,
            limits: config.limits.clone(),
            state: state_rx,
        });

        let dispatcher = Dispatcher::new(config, connection, command_tx, command_rx, state_tx);
        tokio::spawn(dispatcher.run());

        Ok(Self { inner })
    }

    /// Name this handle is registered under.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Register a closure for `category`/`name`. An empty category means `/`.
    ///
    /// Fails with `DuplicateMethod` if the method is already registered; the
    /// first handler stays in place.
    pub async fn register_method<F>(
        &self,
        category: &str,
        name: &str,
        handler: F,
    ) -> Result<(), BusError>
    where
        F: Fn(Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(category, name, Arc::new(handler))
            .await
    }

    /// Register a shared [`MethodHandler`].
    pub async fn register_handler(
        &self,
        category: &str,
        name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), BusError> {
        let key = MethodKey::new(category, name);
        self.request(|reply| Command::Register {
            key,
            handler,
            reply,
        })
        .await?
    }

    /// Remove a registered method. Returns whether it was registered.
    pub async fn unregister_method(&self, category: &str, name: &str) -> Result<bool, BusError> {
        let key = MethodKey::new(category, name);
        self.request(|reply| Command::Unregister { key, reply }).await
    }

    /// Call a method expecting exactly one response.
    ///
    /// `uri` is `luna://service/category/method` (scheme optional).
    pub async fn call(&self, uri: &str, payload: impl Into<Payload>) -> Result<CallHandle, BusError> {
        self.start_call(uri, payload.into(), CallKind::Call).await
    }

    /// Call a method expecting at most two responses.
    pub async fn watch(&self, uri: &str, payload: impl Into<Payload>) -> Result<CallHandle, BusError> {
        self.start_call(uri, payload.into(), CallKind::Watch).await
    }

    /// Subscribe to a method: any number of responses until cancelled.
    pub async fn subscribe(
        &self,
        uri: &str,
        payload: impl Into<Payload>,
    ) -> Result<CallHandle, BusError> {
        self.start_call(uri, payload.into(), CallKind::Subscribe)
            .await
    }

    async fn start_call(
        &self,
        uri: &str,
        payload: Payload,
        kind: CallKind,
    ) -> Result<CallHandle, BusError> {
        let destination = Destination::parse(uri)?;
        if !self.inner.policy.can_call(destination.service()) {
            warn!(
                service = %self.inner.service_name,
                destination = %destination,
                "Outbound call denied"
            );
            return Err(BusError::PermissionDenied {
                service: self.inner.service_name.clone(),
                destination: destination.service().to_string(),
            });
        }
        self.check_payload(&payload)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let call_destination = destination.clone();
        let token = self
            .request(|reply| Command::Call {
                destination: call_destination,
                payload,
                kind,
                events: events_tx,
                reply,
            })
            .await??;

        Ok(CallHandle::new(
            token,
            kind,
            destination,
            events_rx,
            self.inner.commands.clone(),
        ))
    }

    /// Cancel an outbound call by token, notifying the peer best effort.
    pub fn cancel(&self, token: Token) -> Result<(), BusError> {
        self.command(Command::Cancel { token })
    }

    /// Run `task` on this handle's dispatcher after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<(), BusError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        self.command(Command::Schedule { delay, task })
    }

    /// File an inbound subscription request under `key`.
    ///
    /// Usable from inside a handler. Fails with `StaleMessageHandle` if the
    /// request can no longer be answered.
    pub fn subscription_add(&self, key: impl Into<String>, request: &Request) -> Result<(), BusError> {
        if request.is_finished() {
            return Err(BusError::StaleMessageHandle);
        }
        self.command(Command::SubscriptionAdd {
            key: key.into(),
            request: request.clone(),
        })
    }

    /// Respond with `payload` to every subscriber filed under `key`.
    ///
    /// Returns how many subscribers were sent the payload.
    pub async fn subscription_reply(
        &self,
        key: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<usize, BusError> {
        let payload = payload.into();
        self.check_payload(&payload)?;
        let key = key.into();
        self.request(|reply| Command::SubscriptionReply {
            key,
            payload,
            reply,
        })
        .await
    }

    /// Live subscribers filed under `key`.
    pub async fn subscriber_count(&self, key: impl Into<String>) -> Result<usize, BusError> {
        let key = key.into();
        self.request(|reply| Command::SubscriberCount { key, reply })
            .await
    }

    /// Invoke `listener` whenever a caller cancels one of this handle's
    /// inbound requests.
    pub fn on_cancel<F>(&self, listener: F) -> Result<(), BusError>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let listener: CancelListener = Box::new(listener);
        self.command(Command::OnCancel { listener })
    }

    /// Snapshot of this handle's counters.
    pub async fn stats(&self) -> Result<BusStats, BusError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Ask the dispatcher to shut down without waiting for it.
    ///
    /// Responses queued before this call are still sent. Safe to call from
    /// inside a handler.
    pub fn request_shutdown(&self) {
        if self.inner.commands.send(Command::Shutdown).is_err() {
            debug!(service = %self.inner.service_name, "Shutdown requested on closed handle");
        }
    }

    /// Shut down and wait until the handle is disconnected.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        self.closed().await;
    }

    /// Wait until the handle is disconnected, by shutdown or transport loss.
    pub async fn closed(&self) {
        let mut state = self.inner.state.clone();
        // An error means the dispatcher is gone, which is disconnected too.
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    fn check_payload(&self, payload: &Payload) -> Result<(), BusError> {
        let limit = self.inner.limits.max_payload_bytes;
        if payload.len() > limit {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        Ok(())
    }

    fn command(&self, command: Command) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| BusError::Disconnected)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BusError> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply))?;
        response.await.map_err(|_| BusError::Disconnected)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("service_name", &self.inner.service_name)
            .field("state", &self.connection_state())
            .finish()
    }
}
