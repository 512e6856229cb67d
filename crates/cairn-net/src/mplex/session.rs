//! One mplex session per secured connection.
//!
//! A single read loop demultiplexes frames into per-channel buffers; writes
//! from every channel funnel through one lock so frames never interleave on
//! the wire. Channels are tracked in two tables keyed by channel id, one per
//! opening side, which makes `(id, direction)` globally unique.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cairn_core::stream::ByteStream;
use cairn_core::tracker::{Resource, SharedTracker};

use super::channel::{Channel, ChannelShared};
use super::frame::{self, Frame, Tag, MAX_MSG_SIZE};
use super::MuxError;

/// Frames of buffered inbound data per channel before backpressure stalls
/// the session read loop.
const CHANNEL_BUFFER_FRAMES: usize = 16;

/// Called for every channel the remote opens.
pub type StreamHandler = Box<dyn Fn(Channel) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Channels idle longer than this reset themselves. Zero disables.
    pub idle_timeout: Duration,
    /// Upper bound on a single frame payload.
    pub max_msg_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_msg_size: MAX_MSG_SIZE,
        }
    }
}

struct ChannelEntry {
    /// Feeds the channel's read buffer. Taken on remote close/reset so the
    /// reader observes EOF.
    tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<ChannelShared>,
}

pub(crate) struct SessionShared {
    conn: Box<dyn ByteStream>,
    write_lock: Mutex<()>,
    /// Channels this side opened.
    local: DashMap<u64, ChannelEntry>,
    /// Channels the remote opened.
    remote: DashMap<u64, ChannelEntry>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    on_stream: StreamHandler,
    tracker: SharedTracker,
    epoch: Instant,
    config: SessionConfig,
}

impl SessionShared {
    pub(crate) fn epoch_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.conn.remote_addr()
    }

    /// Serialize one frame onto the wire.
    pub(crate) async fn write_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let encoded = frame.encode()?;
        let _guard = self.write_lock.lock().await;
        self.conn.write_all(&encoded).await?;
        Ok(())
    }

    fn table(&self, opened_locally: bool) -> &DashMap<u64, ChannelEntry> {
        if opened_locally {
            &self.local
        } else {
            &self.remote
        }
    }

    /// Drop a channel from its table and settle the accounting, once.
    pub(crate) fn release_channel(&self, id: u64, opened_locally: bool) {
        if let Some((_, entry)) = self.table(opened_locally).remove(&id) {
            if !entry.shared.released.swap(true, Ordering::AcqRel) {
                self.tracker.closed(Resource::MuxChannel);
            }
        }
    }

    fn new_channel(
        self: &Arc<Self>,
        id: u64,
        opened_locally: bool,
        name: String,
    ) -> Channel {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_FRAMES);
        let shared = Arc::new(ChannelShared {
            id,
            initiator: opened_locally,
            name,
            session: Arc::downgrade(self),
            closed_local: AtomicBool::new(false),
            eof_remote: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            released: AtomicBool::new(false),
            last_activity: AtomicU64::new(self.epoch_millis()),
        });
        self.table(opened_locally).insert(
            id,
            ChannelEntry {
                tx: Some(tx),
                shared: shared.clone(),
            },
        );
        self.tracker.opened(Resource::MuxChannel);
        Channel::new(shared, rx)
    }

    /// Reset every open channel and settle session accounting. Returns true
    /// for the one call that performs the transition.
    fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        for table in [&self.local, &self.remote] {
            for entry in table.iter() {
                let ch = &entry.shared;
                ch.reset.store(true, Ordering::Release);
                ch.closed_local.store(true, Ordering::Release);
                ch.eof_remote.store(true, Ordering::Release);
                if !ch.released.swap(true, Ordering::AcqRel) {
                    self.tracker.closed(Resource::MuxChannel);
                }
            }
            // Dropping the entries drops their senders, waking readers.
            table.clear();
        }
        self.tracker.closed(Resource::MuxSession);
        true
    }

    /// Reset every open channel and close the connection. Safe to call from
    /// any task, any number of times.
    async fn close_all(&self) {
        if self.begin_close() {
            if let Err(e) = self.conn.close().await {
                tracing::trace!(error = %e, "session connection close");
            }
        }
    }

    // ── Read-loop frame handling ─────────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        match frame.tag {
            Tag::NewStream => self.handle_new(frame),
            Tag::MsgInitiator | Tag::MsgReceiver => self.handle_msg(frame).await,
            Tag::CloseInitiator | Tag::CloseReceiver => self.handle_close(frame),
            Tag::ResetInitiator | Tag::ResetReceiver => self.handle_reset(frame),
        }
    }

    fn handle_new(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        if self.remote.contains_key(&frame.id) {
            return Err(MuxError::DuplicateChannel(frame.id));
        }
        let name = String::from_utf8_lossy(&frame.data).into_owned();
        tracing::debug!(id = frame.id, name = %name, "remote opened channel");
        let channel = self.new_channel(frame.id, false, name);
        (self.on_stream)(channel);
        Ok(())
    }

    /// Look up the channel a directional frame addresses, validating that
    /// the direction encoded in the tag matches who actually opened it.
    fn lookup(
        &self,
        frame: &Frame,
    ) -> Result<Option<(Option<mpsc::Sender<Bytes>>, Arc<ChannelShared>)>, MuxError> {
        // A tag sent by the channel's initiator addresses a channel the
        // remote opened, and vice versa.
        let opened_locally = !frame.tag.sent_by_initiator();
        if let Some(entry) = self.table(opened_locally).get(&frame.id) {
            return Ok(Some((entry.tx.clone(), entry.shared.clone())));
        }
        if self.table(!opened_locally).contains_key(&frame.id) {
            // The id exists but on the other side — the peer lied about who
            // opened the channel. Fatal for the session.
            return Err(MuxError::DirectionViolation { id: frame.id });
        }
        // Late traffic for a channel we already forgot. Drop it.
        tracing::trace!(id = frame.id, tag = ?frame.tag, "frame for unknown channel dropped");
        Ok(None)
    }

    async fn handle_msg(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        let Some((tx, shared)) = self.lookup(&frame)? else {
            return Ok(());
        };
        if shared.reset.load(Ordering::Acquire) || shared.eof_remote.load(Ordering::Acquire) {
            return Ok(());
        }
        shared.touch();
        if let Some(tx) = tx {
            // Bounded buffer: a full channel stalls this loop, which stalls
            // the remote through TCP backpressure. No locks are held here,
            // and session shutdown still interrupts a stalled send.
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                sent = tx.send(frame.data) => {
                    if sent.is_err() {
                        tracing::trace!(id = frame.id, "reader gone, data dropped");
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_close(&self, frame: Frame) -> Result<(), MuxError> {
        let opened_locally = !frame.tag.sent_by_initiator();
        let complete = {
            let Some(mut entry) = self.table(opened_locally).get_mut(&frame.id) else {
                if self.table(!opened_locally).contains_key(&frame.id) {
                    return Err(MuxError::DirectionViolation { id: frame.id });
                }
                return Ok(());
            };
            entry.shared.eof_remote.store(true, Ordering::Release);
            // Dropping the sender lets the reader drain the buffer and then
            // observe EOF. Buffered data survives a close.
            entry.tx.take();
            entry.shared.closed_local.load(Ordering::Acquire)
                && entry.shared.drained.load(Ordering::Acquire)
        };
        if complete {
            self.release_channel(frame.id, opened_locally);
        }
        Ok(())
    }

    fn handle_reset(&self, frame: Frame) -> Result<(), MuxError> {
        let opened_locally = !frame.tag.sent_by_initiator();
        {
            let Some(entry) = self.table(opened_locally).get(&frame.id) else {
                if self.table(!opened_locally).contains_key(&frame.id) {
                    return Err(MuxError::DirectionViolation { id: frame.id });
                }
                return Ok(());
            };
            let ch = &entry.shared;
            ch.reset.store(true, Ordering::Release);
            ch.closed_local.store(true, Ordering::Release);
            ch.eof_remote.store(true, Ordering::Release);
        }
        tracing::debug!(id = frame.id, "channel reset by remote");
        self.release_channel(frame.id, opened_locally);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                break;
            }
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frame::read_frame(self.conn.as_ref(), self.config.max_msg_size) => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        tracing::warn!(error = %e, "fatal session error");
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("session connection reached EOF");
                    break;
                }
                Err(e) => {
                    if !self.is_closed() {
                        tracing::warn!(error = %e, "session read failed");
                    }
                    break;
                }
            }
        }
        self.close_all().await;
    }

    async fn idle_sweep(self: Arc<Self>) {
        let timeout = self.config.idle_timeout;
        let tick = (timeout / 4).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if self.is_closed() {
                return;
            }
            let cutoff = self.epoch_millis().saturating_sub(timeout.as_millis() as u64);
            let mut idle = Vec::new();
            for table in [&self.local, &self.remote] {
                for entry in table.iter() {
                    if entry.shared.last_activity.load(Ordering::Relaxed) < cutoff
                        && !entry.shared.reset.load(Ordering::Acquire)
                    {
                        idle.push(entry.shared.clone());
                    }
                }
            }
            for ch in idle {
                if ch.reset.swap(true, Ordering::AcqRel) {
                    continue;
                }
                tracing::debug!(id = ch.id, name = %ch.name, "resetting idle channel");
                ch.closed_local.store(true, Ordering::Release);
                ch.eof_remote.store(true, Ordering::Release);
                self.release_channel(ch.id, ch.initiator);
                let frame = Frame::new(ch.id, Tag::reset(ch.initiator), Bytes::new());
                if let Err(e) = self.write_frame(&frame).await {
                    tracing::trace!(id = ch.id, error = %e, "idle reset frame not sent");
                }
            }
        }
    }
}

/// A muxed session over one secured connection.
pub struct Session {
    shared: Arc<SessionShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Wrap `conn` and start the read loop. `on_stream` is invoked for every
    /// channel the remote opens.
    pub fn new(
        conn: Box<dyn ByteStream>,
        config: SessionConfig,
        on_stream: StreamHandler,
        tracker: SharedTracker,
    ) -> Self {
        tracker.opened(Resource::MuxSession);
        let shared = Arc::new(SessionShared {
            conn,
            write_lock: Mutex::new(()),
            local: DashMap::new(),
            remote: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_stream,
            tracker,
            epoch: Instant::now(),
            config,
        });

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(shared.clone().read_loop()));
        if !shared.config.idle_timeout.is_zero() {
            tasks.push(tokio::spawn(shared.clone().idle_sweep()));
        }
        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    /// Open a channel named `name`. Ids are allocated strictly increasing.
    pub async fn open_channel(&self, name: &str) -> Result<Channel, MuxError> {
        if self.shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = self.shared.new_channel(id, true, name.to_string());
        let frame = Frame::new(id, Tag::NewStream, Bytes::copy_from_slice(name.as_bytes()));
        if let Err(e) = self.shared.write_frame(&frame).await {
            self.shared.release_channel(id, true);
            return Err(e);
        }
        tracing::debug!(id, name, "opened channel");
        Ok(channel)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Cancelled when the session closes, however that happens. Lets owners
    /// watch for session death without holding a strong cycle.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.remote_addr()
    }

    /// Close the session: reset all channels, close the connection, and
    /// join the background tasks.
    pub async fn close(&self) {
        self.shared.close_all().await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "session task join");
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Accounting happens synchronously; only the connection teardown
        // needs a task.
        if self.shared.begin_close() {
            let shared = self.shared.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = shared.conn.close().await;
                });
            }
        }
    }
}
