//! # Tether - Client-Side Protocol Endpoint
//!
//! Async client for a message-oriented server, providing:
//! - One persistent duplex connection with automatic reconnect and backoff
//! - Request/response correlation by request id, with timeouts
//! - Fire-and-forget sends
//! - Server pushes fanned out to listeners by topic
//! - A self-describing MessagePack envelope with type-tagged payloads
//!
//! ## Architecture
//!
//! A single driver task owns all connection state; handles talk to it over a channel:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   Client handles → │          Client Driver          │ ⇄ Transport (TCP / memory)
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │ Pending │ │Reconnect│        │
//!                    │  │  Table  │ │ Backoff │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    └───────────────┬─────────────────┘
//!                                    │ Notification
//!                                    ▼
//!                               Dispatcher → listeners (by topic)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use client::{Client, ConnectionState, Notification, CONNECTION_TOPIC};
pub use types::{Config, Error, Result};
