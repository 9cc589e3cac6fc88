//! TCP transport: length-prefixed frames over a `TcpStream`.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::codec::{read_frame, write_frame};
use super::{Link, Transport};
use crate::types::ConnectionConfig;

/// Connects with `TcpStream` and runs one reader and one writer task per link.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    max_frame_bytes: u32,
    outbound_capacity: usize,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            outbound_capacity: config.outbound_capacity,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, url: &str) -> std::io::Result<Link> {
        let addr = url.strip_prefix("tcp://").unwrap_or(url);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, self.connect_timeout),
                )
            })??;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(self.outbound_capacity);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(self.outbound_capacity);

        // Either task ending tears down the other, so the socket closes fully.
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    next = out_rx.recv() => {
                        let Some(frame) = next else { break };
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            tracing::debug!(error = %e, "tcp write failed");
                            break;
                        }
                    }
                }
            }
            writer_closed.cancel();
        });

        let max_frame_bytes = self.max_frame_bytes;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = read_frame(&mut reader, max_frame_bytes) => match frame {
                        Ok(Some(payload)) => {
                            if in_tx.send(Bytes::from(payload)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("tcp peer closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "tcp read failed");
                            break;
                        }
                    },
                }
            }
            closed.cancel();
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
