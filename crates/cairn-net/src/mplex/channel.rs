//! A single logical stream inside an mplex session.
//!
//! Lifecycle: open → (half-closed local / half-closed remote) → closed, with
//! reset reachable from anywhere. After a local close, writes fail but reads
//! continue until the remote closes and the buffer drains. A reset drops
//! buffered data immediately and wakes any pending reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};

use cairn_core::stream::{ByteStream, StreamError};

use super::frame::{Frame, Tag, MAX_MSG_SIZE};
use super::session::SessionShared;

/// Channel state shared between the user-facing handle, the session tables,
/// and the read loop.
pub(crate) struct ChannelShared {
    pub(crate) id: u64,
    /// True when this side opened the channel.
    pub(crate) initiator: bool,
    pub(crate) name: String,
    /// Weak so a channel never keeps its dead session alive.
    pub(crate) session: Weak<SessionShared>,
    pub(crate) closed_local: AtomicBool,
    pub(crate) eof_remote: AtomicBool,
    pub(crate) reset: AtomicBool,
    /// Reader observed EOF with an empty buffer.
    pub(crate) drained: AtomicBool,
    /// Accounting done; the channel is out of the session tables.
    pub(crate) released: AtomicBool,
    /// Milliseconds since the session epoch of the last read/write.
    pub(crate) last_activity: AtomicU64,
}

impl ChannelShared {
    pub(crate) fn touch(&self) {
        if let Some(session) = self.session.upgrade() {
            self.last_activity
                .store(session.epoch_millis(), Ordering::Relaxed);
        }
    }

    /// Release once both directions are done and the buffer is drained.
    pub(crate) fn maybe_release(&self) {
        if self.closed_local.load(Ordering::Acquire)
            && self.eof_remote.load(Ordering::Acquire)
            && self.drained.load(Ordering::Acquire)
        {
            if let Some(session) = self.session.upgrade() {
                session.release_channel(self.id, self.initiator);
            }
        }
    }
}

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    leftover: BytesMut,
}

/// User-facing handle to one mplex channel.
///
/// Dropping a channel that is not fully closed resets it.
pub struct Channel {
    shared: Arc<ChannelShared>,
    read: Mutex<ReadState>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            shared,
            read: Mutex::new(ReadState {
                rx,
                leftover: BytesMut::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Did this side open the channel?
    pub fn is_initiator(&self) -> bool {
        self.shared.initiator
    }

    /// Abort the channel: best-effort reset frame, buffered data dropped,
    /// pending readers woken.
    pub async fn reset(&self) {
        let shared = &self.shared;
        if shared.reset.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.closed_local.store(true, Ordering::Release);
        shared.eof_remote.store(true, Ordering::Release);
        if let Some(session) = shared.session.upgrade() {
            // Remove first so the dropped sender wakes pending readers even
            // if the frame write blocks.
            session.release_channel(shared.id, shared.initiator);
            let frame = Frame::new(shared.id, Tag::reset(shared.initiator), Bytes::new());
            if let Err(e) = session.write_frame(&frame).await {
                tracing::trace!(id = shared.id, error = %e, "reset frame not sent");
            }
        }
    }

    fn mux_write_err(e: super::MuxError) -> StreamError {
        match e {
            super::MuxError::SessionClosed => StreamError::WriteClosed,
            super::MuxError::Stream(e) => e,
            other => StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other,
            )),
        }
    }
}

#[async_trait]
impl ByteStream for Channel {
    async fn read_once(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut state = self.read.lock().await;
        loop {
            if self.shared.reset.load(Ordering::Acquire) {
                state.leftover.clear();
                return Err(StreamError::Reset);
            }
            if !state.leftover.is_empty() {
                let n = buf.len().min(state.leftover.len());
                buf[..n].copy_from_slice(&state.leftover.split_to(n));
                return Ok(n);
            }
            match state.rx.recv().await {
                Some(data) => {
                    self.shared.touch();
                    state.leftover.extend_from_slice(&data);
                }
                None => {
                    if self.shared.reset.load(Ordering::Acquire) {
                        return Err(StreamError::Reset);
                    }
                    self.shared.eof_remote.store(true, Ordering::Release);
                    self.shared.drained.store(true, Ordering::Release);
                    self.shared.maybe_release();
                    return Ok(0);
                }
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), StreamError> {
        let shared = &self.shared;
        if shared.reset.load(Ordering::Acquire) {
            return Err(StreamError::Reset);
        }
        if shared.closed_local.load(Ordering::Acquire) {
            return Err(StreamError::WriteClosed);
        }
        let session = shared.session.upgrade().ok_or(StreamError::WriteClosed)?;
        let tag = Tag::msg(shared.initiator);
        for chunk in data.chunks(MAX_MSG_SIZE) {
            let frame = Frame::new(shared.id, tag, Bytes::copy_from_slice(chunk));
            session.write_frame(&frame).await.map_err(Self::mux_write_err)?;
        }
        shared.touch();
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        if shared.reset.load(Ordering::Acquire) {
            return Ok(());
        }
        if shared.closed_local.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(session) = shared.session.upgrade() {
            let frame = Frame::new(shared.id, Tag::close(shared.initiator), Bytes::new());
            if let Err(e) = session.write_frame(&frame).await {
                tracing::trace!(id = shared.id, error = %e, "close frame not sent");
            }
        }
        shared.maybe_release();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed_local.load(Ordering::Acquire)
    }

    fn at_eof(&self) -> bool {
        self.shared.reset.load(Ordering::Acquire)
            || (self.shared.eof_remote.load(Ordering::Acquire)
                && self.shared.drained.load(Ordering::Acquire))
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.session.upgrade().and_then(|s| s.remote_addr())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        if shared.released.load(Ordering::Acquire) {
            return;
        }
        // An abandoned half-open channel behaves like a reset.
        let was_reset = shared.reset.swap(true, Ordering::AcqRel);
        shared.closed_local.store(true, Ordering::Release);
        shared.eof_remote.store(true, Ordering::Release);
        if let Some(session) = shared.session.upgrade() {
            session.release_channel(shared.id, shared.initiator);
            if !was_reset && !session.is_closed() {
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    rt.spawn(async move {
                        let frame =
                            Frame::new(shared.id, Tag::reset(shared.initiator), Bytes::new());
                        let _ = session.write_frame(&frame).await;
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("initiator", &self.shared.initiator)
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}
