//! Frame transports.
//!
//! The protocol only needs an ordered, reliable stream of frames. [`Socket`]
//! is that contract; [`MemorySocket`] connects two protocols in one process
//! and [`TcpSocket`] carries frames over TCP with a 4-byte big-endian length
//! prefix.

use crate::constants::MAX_PACKET_SIZE;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace};

/// An ordered, reliable frame stream.
///
/// `receive` fails with [`Error::Closed`] once either side closed and no
/// buffered frame remains, and with [`Error::Timeout`] when `timeout`
/// elapses first.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Sends one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Receives the next frame.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Closes both directions. Idempotent.
    async fn close(&self);
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> Result<Vec<u8>>
where
    F: std::future::Future<Output = Result<Vec<u8>>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

// =============================================================================
// In-memory socket
// =============================================================================

/// One end of an in-process socket pair.
pub struct MemorySocket {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: std::sync::Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl MemorySocket {
    /// Creates two connected ends. Closing either closes both.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = std::sync::Arc::new(closed);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(a_rx),
                closed: std::sync::Arc::clone(&closed),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(b_rx),
                closed,
            },
        )
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.tx.send(frame).map_err(|_| Error::Closed)
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        // Frames sent before a close are still delivered
        if let Ok(frame) = rx.try_recv() {
            return Ok(frame);
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut closed = self.closed.subscribe();
        with_timeout(timeout, async {
            tokio::select! {
                biased;
                frame = rx.recv() => frame.ok_or(Error::Closed),
                _ = closed.wait_for(|c| *c) => Err(Error::Closed),
            }
        })
        .await
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

// =============================================================================
// TCP socket
// =============================================================================

fn framing() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_PACKET_SIZE)
        .new_codec()
}

/// Length-prefixed frames over a TCP stream.
pub struct TcpSocket {
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    closed: watch::Sender<bool>,
    peer_addr: SocketAddr,
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl TcpSocket {
    /// Connects to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    /// Wraps an accepted or connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        debug!(peer = %peer_addr, "TCP socket open");
        Ok(Self {
            reader: Mutex::new(FramedRead::new(read, framing())),
            writer: Mutex::new(FramedWrite::new(write, framing())),
            closed: watch::channel(false).0,
            peer_addr,
        })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::Closed);
        }
        if frame.len() > MAX_PACKET_SIZE {
            return Err(Error::protocol(format!(
                "Refusing to send a {} byte frame",
                frame.len()
            )));
        }
        trace!(peer = %self.peer_addr, bytes = frame.len(), "tcp: send");
        self.writer
            .lock()
            .await
            .send(Bytes::from(frame))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Error::Closed,
                _ => Error::Io(e),
            })
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed);
        }
        let mut reader = self.reader.lock().await;
        with_timeout(timeout, async {
            tokio::select! {
                // A local close ends reads even if the remote never hangs up
                _ = closed.wait_for(|c| *c) => Err(Error::Closed),
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => Ok(frame.to_vec()),
                    Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                        Err(Error::protocol(format!("Bad frame: {}", e)))
                    }
                    Some(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                        Err(Error::Closed)
                    }
                    Some(Err(e)) => Err(Error::Io(e)),
                    None => Err(Error::Closed),
                },
            }
        })
        .await
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut *writer).await {
            trace!(peer = %self.peer_addr, error = %e, "tcp: close failed");
        }
    }
}
