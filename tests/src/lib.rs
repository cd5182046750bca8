//! # Sysbus Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs       # Shared services and a raw peer
//!     ├── end_to_end.rs     # Echo, delayed responses, respond-then-exit
//!     ├── calls.rs          # Call, watch, cancel and failure paths
//!     ├── subscriptions.rs  # Fan-out, cancel removal, response windows
//!     └── lifecycle.rs      # Shutdown and transport loss
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p sysbus-tests
//! cargo test -p sysbus-tests integration::subscriptions
//!
//! # Benchmarks
//! cargo bench -p sysbus-tests
//! ```

#![allow(dead_code)]

pub mod integration;
