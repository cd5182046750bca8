//! # Sysbus Types
//!
//! Data model shared by the bus core, transports and services.
//!
//! ## Contents
//!
//! - [`Message`]: the immutable envelope for requests, responses and cancels
//! - [`Payload`]: opaque body with JSON helpers
//! - [`MethodKey`] / [`Destination`]: method addressing and URI parsing
//! - [`FrameCodec`] / [`FrameDecoder`]: versioned, length-prefixed wire framing
//! - [`BusError`] / [`FrameError`]: the error taxonomy

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod errors;
pub mod frame;
pub mod message;
pub mod method;
pub mod payload;

pub use errors::{BusError, FrameError};
pub use frame::{FrameCodec, FrameDecoder, PROTOCOL_VERSION};
pub use message::{codes, Message, MessageId, MessageKind, RemoteError, Token, ERROR_CATEGORY};
pub use method::{Destination, MethodKey, ROOT_CATEGORY};
pub use payload::Payload;
