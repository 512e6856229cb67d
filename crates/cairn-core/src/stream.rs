//! The byte-stream seam every layer of the stack composes over.
//!
//! One capability set — `read_once` / `write_all` / `close` / `is_closed` /
//! `at_eof` — implemented by raw sockets, secured connections, and muxed
//! channels alike. Each layer owns the layer beneath it; polymorphism lives
//! only at this boundary.
//!
//! Methods take `&self` so a read loop and writers can share one stream
//! handle: implementations serialize internally (read path and write path
//! each behind their own lock).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::varint::{self, VarintError};

/// Who opened a connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// EOF arrived before the expected number of bytes.
    #[error("incomplete read: wanted {wanted} more bytes at EOF")]
    IncompleteRead { wanted: usize },

    #[error("read on closed stream")]
    ReadClosed,

    #[error("write on closed stream")]
    WriteClosed,

    /// A length-prefixed message exceeded the caller's bound.
    #[error("message of {len} bytes exceeds limit {max}")]
    LimitExceeded { len: usize, max: usize },

    #[error("invalid length prefix: {0}")]
    BadPrefix(#[from] VarintError),

    /// The stream was reset (muxed channels only).
    #[error("stream reset")]
    Reset,
}

/// The single byte-stream capability set.
///
/// `read_once` performs at most one read and returns `Ok(0)` at EOF.
/// `write_all` writes the whole buffer or fails. Both may suspend at any
/// point and must tolerate cancellation.
#[async_trait]
pub trait ByteStream: Send + Sync {
    async fn read_once(&self, buf: &mut [u8]) -> Result<usize, StreamError>;

    async fn write_all(&self, data: &[u8]) -> Result<(), StreamError>;

    /// Close the write direction and release the underlying resource once
    /// both directions are done. Idempotent.
    async fn close(&self) -> Result<(), StreamError>;

    fn is_closed(&self) -> bool;

    fn at_eof(&self) -> bool;

    /// Remote endpoint as observed by us, when the stream has one.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// ── Length-prefixed helpers ───────────────────────────────────────────────────

/// Read exactly `buf.len()` bytes or fail with `IncompleteRead`.
pub async fn read_exact<S: ByteStream + ?Sized>(
    stream: &S,
    buf: &mut [u8],
) -> Result<(), StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read_once(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(StreamError::IncompleteRead {
                wanted: buf.len() - filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read a varint, one byte at a time.
pub async fn read_uvarint<S: ByteStream + ?Sized>(stream: &S) -> Result<u64, StreamError> {
    let mut bytes = [0u8; varint::MAX_LEN];
    for i in 0..varint::MAX_LEN {
        read_exact(stream, &mut bytes[i..i + 1]).await?;
        if bytes[i] & 0x80 == 0 {
            let (value, _) = varint::get_uvarint(&bytes[..i + 1])?;
            return Ok(value);
        }
    }
    Err(VarintError::Overflow.into())
}

/// Read one varint-length-prefixed message of at most `max` bytes.
pub async fn read_lp<S: ByteStream + ?Sized>(
    stream: &S,
    max: usize,
) -> Result<Vec<u8>, StreamError> {
    let len = read_uvarint(stream).await? as usize;
    if len > max {
        return Err(StreamError::LimitExceeded { len, max });
    }
    let mut buf = vec![0u8; len];
    read_exact(stream, &mut buf).await?;
    Ok(buf)
}

/// Write one varint-length-prefixed message as a single write.
pub async fn write_lp<S: ByteStream + ?Sized>(
    stream: &S,
    data: &[u8],
) -> Result<(), StreamError> {
    let mut framed = Vec::with_capacity(varint::MAX_LEN + data.len());
    varint::put_uvarint(&mut framed, data.len() as u64)?;
    framed.extend_from_slice(data);
    stream.write_all(&framed).await
}

// ── Socket adapter ────────────────────────────────────────────────────────────

/// Adapts any async socket (TCP stream, in-memory duplex) to `ByteStream`.
///
/// The socket is split once; the read and write halves each sit behind a
/// FIFO-fair lock, so concurrent readers are served in arrival order and
/// writes never interleave.
///
/// `close` shuts down only the write direction: reads keep draining
/// in-flight data until the peer's side ends too, and only then report
/// `ReadClosed`. The socket itself is released when both halves drop.
pub struct SocketStream<T> {
    read: Mutex<ReadHalf<T>>,
    write: Mutex<WriteHalf<T>>,
    closed: AtomicBool,
    eof: AtomicBool,
    remote: Option<SocketAddr>,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> SocketStream<T> {
    pub fn new(io: T, remote: Option<SocketAddr>) -> Self {
        let (r, w) = tokio::io::split(io);
        Self {
            read: Mutex::new(r),
            write: Mutex::new(w),
            closed: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            remote,
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + 'static> ByteStream for SocketStream<T> {
    async fn read_once(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        // A local close only stops reads once the peer's direction has also
        // ended; until then in-flight data still drains.
        if self.closed.load(Ordering::Acquire) && self.eof.load(Ordering::Acquire) {
            return Err(StreamError::ReadClosed);
        }
        let mut half = self.read.lock().await;
        let n = half.read(buf).await?;
        if n == 0 {
            self.eof.store(true, Ordering::Release);
        }
        Ok(n)
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::WriteClosed);
        }
        let mut half = self.write.lock().await;
        half.write_all(data).await?;
        half.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Write-only shutdown: the peer sees EOF, our read half stays usable.
        // Shutdown failures on an already-dead socket are not interesting.
        let mut half = self.write.lock().await;
        let _ = half.shutdown().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn at_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
