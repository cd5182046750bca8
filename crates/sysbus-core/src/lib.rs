//! # Sysbus Core
//!
//! The service bus endpoint: register named methods, answer requests, call
//! other services and hold subscriptions open with optional response windows.
//!
//! ## Architecture
//!
//! ```text
//!   Handle (clone) ──commands──►  Dispatcher task  ◄──frames── Transport
//!                                   │  MethodRegistry   (inbound requests)
//!                                   │  CallTracker      (outbound calls)
//!                                   │  TimerQueue       (timeouts, tasks)
//!                                   └  subscriber lists
//! ```
//!
//! Each handle owns one dispatcher task. Everything that touches the registry
//! or the tracker runs on that task, so handlers, listeners and timers never
//! race each other.
//!
//! ## Modules
//!
//! - [`handle`]: the public API
//! - [`tracker`]: outbound call bookkeeping and timeout rules
//! - [`registry`]: method table and the [`MethodHandler`] trait
//! - [`transport`]: the transport boundary and the in-memory [`LocalBus`]
//! - [`config`] / [`permissions`]: configuration and outbound access policy

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod call;
pub mod config;
mod dispatcher;
pub mod handle;
pub mod permissions;
pub mod registry;
pub mod request;
mod subscriptions;
mod timer;
pub mod tracker;
pub mod transport;

pub use call::CallHandle;
pub use config::{BusConfig, ConfigError, LimitsConfig, PermissionsConfig, TimeoutConfig};
pub use dispatcher::{BusStats, CancelListener};
pub use handle::{ConnectionState, Handle};
pub use permissions::{AccessPolicy, OutboundPermissions, ServicePattern};
pub use registry::{MethodHandler, MethodRegistry};
pub use request::Request;
pub use tracker::{CallEvent, CallKind, CallState, CallTracker, Listener, PendingCall, TrackerStats};
pub use transport::{Connection, InboundStream, LocalBus, LocalTransport, Transport};

// Re-export the data model so most users need a single dependency.
pub use sysbus_types::{
    codes, BusError, Destination, FrameCodec, FrameDecoder, FrameError, Message, MessageId,
    MessageKind, MethodKey, Payload, RemoteError, Token, ERROR_CATEGORY, PROTOCOL_VERSION,
};
