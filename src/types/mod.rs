//! Core types for the protocol client.
//!
//! This module provides foundational types used throughout the crate:
//! - **IDs**: the request correlation id
//! - **Errors**: error taxonomy with thiserror derives
//! - **Config**: connection, reconnect, request and observability settings

mod config;
mod errors;
mod ids;

pub use config::{Config, ConnectionConfig, ObservabilityConfig, ReconnectConfig, RequestConfig};
pub use errors::{Error, Result};
pub use ids::RequestId;
