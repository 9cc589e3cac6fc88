//! In-process loopback transport.
//!
//! `MemoryTransport::new()` returns the client half and a [`MemoryAcceptor`]
//! that plays the server: every successful connect shows up as a
//! [`PeerLink`]. Dropping the peer link closes that connection from the
//! server side.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Link, Transport};

const LINK_CAPACITY: usize = 256;

/// Server end of one in-memory connection.
#[derive(Debug)]
pub struct PeerLink {
    /// URL the client dialed.
    pub url: String,
    /// Frames sent by the client.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Frames delivered to the client.
    pub outbound: mpsc::Sender<Bytes>,
}

#[derive(Debug)]
struct Shared {
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

/// Client half of the loopback.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<PeerLink>,
    shared: Arc<Shared>,
}

/// Server half of the loopback.
#[derive(Debug)]
pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<PeerLink>,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MemoryTransport, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        (
            MemoryTransport {
                accept_tx,
                shared: shared.clone(),
            },
            MemoryAcceptor { accept_rx, shared },
        )
    }
}

impl MemoryAcceptor {
    /// Wait for the next connection. `None` once every transport is dropped.
    pub async fn accept(&mut self) -> Option<PeerLink> {
        self.accept_rx.recv().await
    }

    /// Next connection if one is already waiting.
    pub fn try_accept(&mut self) -> Option<PeerLink> {
        self.accept_rx.try_recv().ok()
    }

    /// While set, connects fail with `ConnectionRefused`.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> std::io::Result<Link> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", url),
            ));
        }

        let (to_server_tx, to_server_rx) = mpsc::channel(LINK_CAPACITY);
        let (to_client_tx, to_client_rx) = mpsc::channel(LINK_CAPACITY);

        let peer = PeerLink {
            url: url.to_string(),
            inbound: to_server_rx,
            outbound: to_client_tx,
        };
        self.accept_tx.send(peer).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no acceptor listening for {}", url),
            )
        })?;

        Ok(Link {
            outbound: to_server_tx,
            inbound: to_client_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_carries_frames_both_ways() {
        let (transport, mut acceptor) = MemoryTransport::new();

        let mut link = transport.connect("mem://server").await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        assert_eq!(peer.url, "mem://server");

        link.outbound.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(peer.inbound.recv().await.unwrap(), Bytes::from_static(b"ping"));

        peer.outbound.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), Bytes::from_static(b"pong"));

        drop(peer);
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refusing_acceptor_fails_connects() {
        let (transport, acceptor) = MemoryTransport::new();
        acceptor.set_refusing(true);

        let err = transport.connect("mem://server").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
        assert_eq!(acceptor.attempts(), 1);
    }

    #[tokio::test]
    async fn test_dropped_acceptor_refuses() {
        let (transport, acceptor) = MemoryTransport::new();
        drop(acceptor);

        assert!(transport.connect("mem://server").await.is_err());
    }
}
