//! # Message Envelope
//!
//! The single envelope for all bus traffic.
//!
//! ## Properties
//!
//! - **Immutability**: fields are private and only readable once constructed.
//! - **Correlation**: responses and cancels carry the token of the request they refer to.
//! - **Errors in-band**: remote failures travel as responses in [`ERROR_CATEGORY`].

use crate::method::{Destination, MethodKey};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Category carried by error responses.
pub const ERROR_CATEGORY: &str = "/sysbus/error";

/// Error codes carried by error responses (JSON-RPC numbering).
pub mod codes {
    /// No handler registered for the requested method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// The handler failed while processing the request.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Correlation identifier linking a request to its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(u64);

impl Token {
    /// Wrap a raw token value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw token value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one constructed message (UUID v7, time ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a frame means to its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Invoke a method.
    Request,
    /// Answer a request.
    Response,
    /// The caller abandons a request.
    Cancel,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    /// Always false; present so error bodies look like ordinary service replies.
    pub return_value: bool,
    /// Error code, see [`codes`].
    pub error_code: i32,
    /// Human readable description.
    pub error_text: String,
}

/// An immutable bus message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    kind: MessageKind,
    token: Token,
    sender: String,
    destination: String,
    category: String,
    method: String,
    payload: Payload,
    is_subscription: bool,
    is_last_response: bool,
}

impl Message {
    /// Build a request for `destination`, sent by `sender` under `token`.
    pub fn request(
        sender: impl Into<String>,
        destination: &Destination,
        token: Token,
        payload: Payload,
        is_subscription: bool,
    ) -> Self {
        Self {
            id: MessageId::new(),
            kind: MessageKind::Request,
            token,
            sender: sender.into(),
            destination: destination.service().to_string(),
            category: destination.method().category().to_string(),
            method: destination.method().name().to_string(),
            payload,
            is_subscription,
            is_last_response: false,
        }
    }

    /// Build a response to `request`. The responder becomes the sender.
    pub fn response_to(request: &Message, payload: Payload, is_last_response: bool) -> Self {
        Self {
            id: MessageId::new(),
            kind: MessageKind::Response,
            token: request.token,
            sender: request.destination.clone(),
            destination: request.sender.clone(),
            category: request.category.clone(),
            method: request.method.clone(),
            payload,
            is_subscription: request.is_subscription,
            is_last_response,
        }
    }

    /// Build a terminal error response to `request`.
    pub fn error_response(request: &Message, error_code: i32, error_text: impl Into<String>) -> Self {
        let body = RemoteError {
            return_value: false,
            error_code,
            error_text: error_text.into(),
        };
        let method = match error_code {
            codes::METHOD_NOT_FOUND => "MethodNotFound",
            _ => "InternalError",
        };
        Self {
            id: MessageId::new(),
            kind: MessageKind::Response,
            token: request.token,
            sender: request.destination.clone(),
            destination: request.sender.clone(),
            category: ERROR_CATEGORY.to_string(),
            method: method.to_string(),
            payload: Payload::json(&body).unwrap_or_default(),
            is_subscription: request.is_subscription,
            is_last_response: true,
        }
    }

    /// Build a cancel for the call identified by `token` at `destination`.
    pub fn cancel(sender: impl Into<String>, destination: &Destination, token: Token) -> Self {
        Self {
            id: MessageId::new(),
            kind: MessageKind::Cancel,
            token,
            sender: sender.into(),
            destination: destination.service().to_string(),
            category: destination.method().category().to_string(),
            method: destination.method().name().to_string(),
            payload: Payload::empty(),
            is_subscription: false,
            is_last_response: true,
        }
    }

    /// Unique id of this message.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Request, response or cancel.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Correlation token.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Service name of the sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Service name of the receiver.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Method category.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Registry key for this message's method.
    #[must_use]
    pub fn method_key(&self) -> MethodKey {
        MethodKey::new(&self.category, self.method.clone())
    }

    /// Body.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether the originating call expects multiple responses.
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.is_subscription
    }

    /// Whether no further responses follow this one.
    #[must_use]
    pub fn is_last_response(&self) -> bool {
        self.is_last_response
    }

    /// Whether this is an error response.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Response && self.category == ERROR_CATEGORY
    }

    /// Whether no further responses follow for this token.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.is_last_response || self.is_error()
    }

    /// Decode the error body of an error response.
    #[must_use]
    pub fn remote_error(&self) -> Option<RemoteError> {
        if !self.is_error() {
            return None;
        }
        self.payload.parse_json().ok()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .field("sender", &self.sender)
            .field("destination", &self.destination)
            .field("method", &format_args!("{}/{}", self.category, self.method))
            .field("payload", &self.payload)
            .field("last", &self.is_last_response)
            .finish()
    }
}
