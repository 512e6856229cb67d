//! Transport contract and the TCP implementation.
//!
//! A transport hands out raw byte streams; everything above it (security,
//! muxing, negotiation) is transport-agnostic.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use cairn_core::stream::{ByteStream, SocketStream};
use cairn_core::Direction;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

/// A freshly established, un-upgraded connection.
pub struct RawConnection {
    pub io: Box<dyn ByteStream>,
    pub direction: Direction,
    /// Remote endpoint as seen by us.
    pub observed_addr: SocketAddr,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("direction", &self.direction)
            .field("observed_addr", &self.observed_addr)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError>;
    async fn dial(&self, addr: SocketAddr) -> Result<RawConnection, TransportError>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection. Returns `Closed` after
    /// [`Listener::close`] — callers treat that as loop exit, not an error.
    async fn accept(&self) -> Result<RawConnection, TransportError>;

    fn local_addr(&self) -> SocketAddr;

    fn close(&self);
}

// ── TCP ───────────────────────────────────────────────────────────────────────

pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "listening");
        Ok(Box::new(TcpListenerHandle {
            listener,
            local,
            cancel: CancellationToken::new(),
        }))
    }

    async fn dial(&self, addr: SocketAddr) -> Result<RawConnection, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let observed = stream.peer_addr()?;
        Ok(RawConnection {
            io: Box::new(SocketStream::new(stream, Some(observed))),
            direction: Direction::Outbound,
            observed_addr: observed,
        })
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
    local: SocketAddr,
    cancel: CancellationToken,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> Result<RawConnection, TransportError> {
        let (stream, observed) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Closed),
            accepted = self.listener.accept() => accepted?,
        };
        stream.set_nodelay(true)?;
        Ok(RawConnection {
            io: Box::new(SocketStream::new(stream, Some(observed))),
            direction: Direction::Inbound,
            observed_addr: observed,
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
