//! Byte-stream transport contract.
//!
//! A transport turns a URL into a [`Link`]. The link maps the three
//! transport events onto channels:
//!   - **open**: `connect` returned `Ok`
//!   - **message**: a frame arrived on `inbound`
//!   - **close**: `inbound` yielded `None` (either side, normal or abnormal)
//!
//! Dropping a `Link` closes the underlying connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

pub mod codec;
pub mod memory;
pub mod tcp;

pub use memory::{MemoryAcceptor, MemoryTransport, PeerLink};
pub use tcp::TcpTransport;

/// One open connection, as a pair of frame channels.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Bytes>,
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Opens connections to a server.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn connect(&self, url: &str) -> std::io::Result<Link>;
}
