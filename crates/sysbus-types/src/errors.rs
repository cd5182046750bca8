//! # Error Types
//!
//! Defines the error taxonomy shared by the bus core and its transports.

use crate::message::Token;
use thiserror::Error;

/// Errors surfaced by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A handler is already registered for this (category, method) key.
    #[error("Duplicate method: {category}/{method} is already registered")]
    DuplicateMethod { category: String, method: String },

    /// No handler is registered for this (category, method) key.
    #[error("Method not found: {category}/{method}")]
    MethodNotFound { category: String, method: String },

    /// The inbound message was completed, cancelled by its sender, or torn down.
    #[error("Stale message handle: the request can no longer be answered")]
    StaleMessageHandle,

    /// A response or cancel referenced a token with no active call.
    #[error("Unknown token: {0}")]
    UnknownToken(Token),

    /// The transport could not deliver to the destination.
    #[error("Transport unavailable for {destination}: {reason}")]
    TransportUnavailable { destination: String, reason: String },

    /// The local service is not authorized to call the destination.
    #[error("Permission denied: {service} may not call {destination}")]
    PermissionDenied { service: String, destination: String },

    /// The destination URI could not be parsed.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Another endpoint already holds this service name.
    #[error("Service name already in use: {0}")]
    NameInUse(String),

    /// The handle has been shut down.
    #[error("Handle disconnected")]
    Disconnected,

    /// The payload exceeds the configured limit.
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The number of outstanding calls reached the configured limit.
    #[error("Too many pending calls: limit is {limit}")]
    TooManyPendingCalls { limit: usize },

    /// A frame could not be encoded or decoded.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl BusError {
    /// Build a `TransportUnavailable` error.
    pub fn transport_unavailable(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            destination: destination.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the length prefix announces.
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The announced body exceeds the configured maximum.
    #[error("Frame too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    /// The frame was produced by an incompatible protocol version.
    #[error("Unsupported version: received {received}, supported {supported}")]
    UnsupportedVersion { received: u16, supported: u16 },

    /// The body could not be (de)serialized.
    #[error("Malformed frame: {0}")]
    Malformed(String),
}
