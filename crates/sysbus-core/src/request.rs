//! Inbound request handed to method handlers.
//!
//! A `Request` is a cheap clone of a shared record. Handlers may keep clones
//! past their return and respond later (from a scheduled task, for example).
//! Once the request is finished, cancelled by the caller, or the handle is torn
//! down, every respond fails with `StaleMessageHandle`.

use crate::dispatcher::Command;
use crate::timer::Task;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sysbus_types::{BusError, Message, MethodKey, Payload, Token};
use tokio::sync::mpsc;

pub(crate) struct RequestState {
    message: Message,
    finished: AtomicBool,
    cancelled: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
    max_payload_bytes: usize,
}

/// A request received by a registered method.
#[derive(Clone)]
pub struct Request {
    state: Arc<RequestState>,
}

impl Request {
    pub(crate) fn new(
        message: Message,
        commands: mpsc::UnboundedSender<Command>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            state: Arc::new(RequestState {
                message,
                finished: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                commands,
                max_payload_bytes,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RequestState> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn upgrade(state: &Weak<RequestState>) -> Option<Self> {
        state.upgrade().map(|state| Self { state })
    }

    /// The request message as received.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.state.message
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        self.state.message.payload()
    }

    /// Service that sent the request.
    #[must_use]
    pub fn sender(&self) -> &str {
        self.state.message.sender()
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.state.message.token()
    }

    #[must_use]
    pub fn method_key(&self) -> MethodKey {
        self.state.message.method_key()
    }

    /// Whether the caller expects more than one response.
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.state.message.is_subscription()
    }

    /// Whether responding is no longer possible.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Whether the caller cancelled this request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Send a response. May be called repeatedly for streaming replies.
    pub fn respond(&self, payload: impl Into<Payload>) -> Result<(), BusError> {
        self.send_response(payload.into(), false)
    }

    /// Send the final response and finish the request.
    pub fn respond_last(&self, payload: impl Into<Payload>) -> Result<(), BusError> {
        self.send_response(payload.into(), true)
    }

    /// Finish the request with an empty final response.
    pub fn complete(&self) -> Result<(), BusError> {
        self.send_response(Payload::empty(), true)
    }

    /// Run `task` on the handle's dispatcher after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<(), BusError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        self.state
            .commands
            .send(Command::Schedule { delay, task })
            .map_err(|_| BusError::Disconnected)
    }

    fn send_response(&self, payload: Payload, last: bool) -> Result<(), BusError> {
        if payload.len() > self.state.max_payload_bytes {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                limit: self.state.max_payload_bytes,
            });
        }

        let stale = if last {
            self.state.finished.swap(true, Ordering::AcqRel)
        } else {
            self.is_finished()
        };
        if stale {
            return Err(BusError::StaleMessageHandle);
        }

        let message = Message::response_to(&self.state.message, payload, last);
        self.state
            .commands
            .send(Command::Send { message })
            .map_err(|_| BusError::StaleMessageHandle)
    }

    /// Finish with an error response unless already finished.
    pub(crate) fn fail(&self, code: i32, text: &str) -> bool {
        if self.state.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        let message = Message::error_response(&self.state.message, code, text);
        self.state.commands.send(Command::Send { message }).is_ok()
    }

    pub(crate) fn mark_cancelled(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.finished.store(true, Ordering::Release);
    }

    pub(crate) fn mark_stale(&self) {
        self.state.finished.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("token", &self.token())
            .field("sender", &self.sender())
            .field("method", &self.method_key())
            .field("finished", &self.is_finished())
            .finish()
    }
}
