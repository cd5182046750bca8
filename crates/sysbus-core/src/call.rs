//! Caller-side view of an outbound call.

use crate::dispatcher::Command;
use crate::tracker::{CallEvent, CallKind, Listener};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use sysbus_types::{BusError, Destination, Message, Token};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Handle to one outbound call, watch or subscription.
///
/// Every call has a built-in first listener that feeds this handle's event
/// stream, so nothing delivered before [`CallHandle::add_listener`] is lost.
/// The stream ends once the call is completed, timed out (calls and watches),
/// cancelled or torn down.
///
/// Dropping the handle does not cancel the call.
#[derive(Debug)]
pub struct CallHandle {
    token: Token,
    kind: CallKind,
    destination: Destination,
    events: mpsc::UnboundedReceiver<CallEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    pub(crate) fn new(
        token: Token,
        kind: CallKind,
        destination: Destination,
        events: mpsc::UnboundedReceiver<CallEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            token,
            kind,
            destination,
            events,
            commands,
        }
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Attach a listener. Listeners run on the dispatcher in registration order
    /// and see events delivered after they are attached.
    pub fn add_listener<F>(&self, listener: F) -> Result<(), BusError>
    where
        F: FnMut(&CallEvent) + Send + 'static,
    {
        let listener: Listener = Box::new(listener);
        self.command(Command::AddListener {
            token: self.token,
            listener,
        })
    }

    /// Arm a response window. Replaces any window armed before.
    ///
    /// When it elapses without a response, listeners receive
    /// [`CallEvent::TimedOut`]. Calls and watches then end; subscriptions stay
    /// open and start a new window.
    pub fn set_response_timeout(&self, window: Duration) -> Result<(), BusError> {
        self.command(Command::SetTimeout {
            token: self.token,
            window,
        })
    }

    /// Stop the call and tell the peer, best effort.
    pub fn cancel(&self) -> Result<(), BusError> {
        self.command(Command::Cancel { token: self.token })
    }

    /// Next event, or None once the call has ended.
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    /// Next response, skipping timeout notifications.
    pub async fn next_response(&mut self) -> Option<Message> {
        loop {
            match self.events.recv().await? {
                CallEvent::Response(message) => return Some(message),
                CallEvent::TimedOut { .. } => continue,
            }
        }
    }

    /// Next already-delivered event without waiting.
    pub fn try_next(&mut self) -> Option<CallEvent> {
        self.events.try_recv().ok()
    }

    fn command(&self, command: Command) -> Result<(), BusError> {
        self.commands
            .send(command)
            .map_err(|_| BusError::Disconnected)
    }
}

impl Stream for CallHandle {
    type Item = CallEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
