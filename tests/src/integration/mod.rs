//! Cross-handle scenarios over [`sysbus_core::LocalBus`].

pub mod fixtures;

mod calls;
mod lifecycle;
mod subscriptions;
