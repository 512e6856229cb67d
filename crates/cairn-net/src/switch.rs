//! The switch: single entry point for dialing, listening, and protocol
//! dispatch.
//!
//! Both accepted and dialed sockets run the same upgrade pipeline —
//! multistream security negotiation, Noise handshake, multistream muxer
//! negotiation, mplex session — and land in the per-peer connection table.
//! Channels the remote opens are negotiated against the registered
//! application protocols and handed to their handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;

use cairn_core::stream::ByteStream;
use cairn_core::tracker::{Resource, SharedTracker};
use cairn_core::{Direction, Keypair, PeerId, PeerInfo};

use crate::mplex::{self, Channel, MuxError, Session, SessionConfig, StreamHandler};
use crate::multistream::{self, NegotiationError, ProtocolMatcher};
use crate::noise::{self, NoiseError};
use crate::transport::{Listener, RawConnection, Transport, TransportError};

/// Deadline for negotiating the protocol on a fresh channel.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("dial to {peer} failed: {reason}")]
    DialFailed { peer: PeerId, reason: String },

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Handshake(#[from] NoiseError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("switch closed")]
    Closed,
}

/// Fired for every connection added to or removed from the table.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Fired exactly once per peer membership episode.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Joined(PeerId),
    Left(PeerId),
}

pub type ConnectionHook = Arc<dyn Fn(ConnectionEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PeerHook = Arc<dyn Fn(PeerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handles one negotiated inbound channel from the given peer.
pub type ProtocolHandler =
    Arc<dyn Fn(Channel, String, PeerId) -> BoxFuture<'static, ()> + Send + Sync>;

struct ProtocolEntry {
    matcher: ProtocolMatcher,
    handler: ProtocolHandler,
}

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: noise::HANDSHAKE_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

/// One upgraded, muxed connection to a peer.
pub struct SessionHandle {
    pub(crate) session: Session,
    peer: PeerId,
    direction: Direction,
    observed_addr: SocketAddr,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("observed_addr", &self.observed_addr)
            .finish()
    }
}

impl SessionHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Remote endpoint as seen by us.
    pub fn observed_addr(&self) -> SocketAddr {
        self.observed_addr
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub async fn open_channel(&self, name: &str) -> Result<Channel, MuxError> {
        self.session.open_channel(name).await
    }
}

type DialWaiter = oneshot::Sender<Result<Arc<SessionHandle>, String>>;

struct SwitchInner {
    identity: Arc<Keypair>,
    local_peer: PeerId,
    transport: Arc<dyn Transport>,
    config: SwitchConfig,
    tracker: SharedTracker,
    protocols: RwLock<Vec<ProtocolEntry>>,
    peers: DashMap<PeerId, Vec<Arc<SessionHandle>>>,
    pending_dials: StdMutex<HashMap<PeerId, Vec<DialWaiter>>>,
    conn_hooks: RwLock<Vec<ConnectionHook>>,
    peer_hooks: RwLock<Vec<PeerHook>>,
    listeners: StdMutex<Vec<Arc<dyn Listener>>>,
    closed: AtomicBool,
}

impl SwitchInner {
    // ── Events ───────────────────────────────────────────────────────────────

    fn fire_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        let hooks: Vec<ConnectionHook> =
            self.conn_hooks.read().expect("hook lock").iter().cloned().collect();
        if hooks.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for hook in hooks {
                hook(event.clone()).await;
            }
        });
    }

    fn fire_peer_event(self: &Arc<Self>, event: PeerEvent) {
        let hooks: Vec<PeerHook> =
            self.peer_hooks.read().expect("hook lock").iter().cloned().collect();
        if hooks.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for hook in hooks {
                hook(event.clone()).await;
            }
        });
    }

    // ── Connection table ─────────────────────────────────────────────────────

    fn existing(&self, peer: &PeerId) -> Option<Arc<SessionHandle>> {
        self.peers
            .get(peer)
            .and_then(|sessions| sessions.iter().find(|s| !s.is_closed()).cloned())
    }

    fn add_session(self: &Arc<Self>, handle: Arc<SessionHandle>) {
        let first = {
            let mut slot = self.peers.entry(handle.peer.clone()).or_default();
            let first = slot.is_empty();
            slot.push(handle.clone());
            first
        };
        tracing::info!(
            peer = %handle.peer.short(),
            direction = ?handle.direction,
            addr = %handle.observed_addr,
            "connection established"
        );

        // Watch for the session dying on its own (read loop exit, remote
        // close) and settle the table from one place.
        let inner = self.clone();
        let watched = handle.clone();
        let token = watched.session.closed_token();
        tokio::spawn(async move {
            token.cancelled().await;
            inner.remove_session(&watched);
        });

        self.fire_connection_event(ConnectionEvent::Connected(handle.peer.clone()));
        if first {
            self.fire_peer_event(PeerEvent::Joined(handle.peer.clone()));
        }
    }

    /// Remove a session from the table, settling accounting and events.
    /// Idempotent — the session-death watcher and explicit disconnects race
    /// here by design.
    fn remove_session(self: &Arc<Self>, handle: &Arc<SessionHandle>) {
        let mut removed = false;
        let mut last = false;
        if let Some(mut sessions) = self.peers.get_mut(&handle.peer) {
            if let Some(pos) = sessions.iter().position(|s| Arc::ptr_eq(s, handle)) {
                sessions.remove(pos);
                removed = true;
                last = sessions.is_empty();
            }
        }
        if last {
            self.peers.remove_if(&handle.peer, |_, sessions| sessions.is_empty());
        }
        if removed {
            self.tracker.closed(Resource::SecureChannel);
            self.tracker.closed(Resource::Connection);
            tracing::info!(peer = %handle.peer.short(), "connection removed");
            self.fire_connection_event(ConnectionEvent::Disconnected(handle.peer.clone()));
            if last {
                self.fire_peer_event(PeerEvent::Left(handle.peer.clone()));
            }
        }
    }

    // ── Upgrade pipeline ─────────────────────────────────────────────────────

    async fn upgrade(
        self: &Arc<Self>,
        raw: RawConnection,
        expected: Option<&PeerId>,
    ) -> Result<Arc<SessionHandle>, SwitchError> {
        self.tracker.opened(Resource::Connection);
        match self.upgrade_pipeline(raw, expected).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.tracker.closed(Resource::Connection);
                Err(e)
            }
        }
    }

    async fn upgrade_pipeline(
        self: &Arc<Self>,
        raw: RawConnection,
        expected: Option<&PeerId>,
    ) -> Result<Arc<SessionHandle>, SwitchError> {
        let RawConnection {
            io,
            direction,
            observed_addr,
        } = raw;

        // 1. Agree on a security protocol.
        let negotiated = match direction {
            Direction::Outbound => multistream::select(io.as_ref(), &[noise::PROTOCOL_ID]).await,
            Direction::Inbound => {
                multistream::handle(io.as_ref(), &[ProtocolMatcher::exact(noise::PROTOCOL_ID)])
                    .await
            }
        };
        if let Err(e) = negotiated {
            let _ = io.close().await;
            return Err(e.into());
        }

        // 2. Noise handshake. Consumes the raw stream.
        let deadline = self.config.handshake_timeout;
        let secure = match direction {
            Direction::Outbound => {
                noise::secure_outbound(io, &self.identity, expected, deadline).await?
            }
            Direction::Inbound => noise::secure_inbound(io, &self.identity, deadline).await?,
        };
        self.tracker.opened(Resource::SecureChannel);
        let remote_peer = secure.remote_peer().clone();

        // 3. Agree on a muxer over the secured connection.
        let negotiated = match direction {
            Direction::Outbound => multistream::select(&secure, &[mplex::PROTOCOL_ID]).await,
            Direction::Inbound => {
                multistream::handle(&secure, &[ProtocolMatcher::exact(mplex::PROTOCOL_ID)]).await
            }
        };
        if let Err(e) = negotiated {
            self.tracker.closed(Resource::SecureChannel);
            let _ = secure.close().await;
            return Err(e.into());
        }

        // 4. Mux it. Inbound channels flow into the protocol dispatcher.
        let weak = Arc::downgrade(self);
        let peer = remote_peer.clone();
        let on_stream: StreamHandler = Box::new(move |channel| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let peer = peer.clone();
            tokio::spawn(async move {
                inner.dispatch_channel(peer, channel).await;
            });
        });
        let session = Session::new(
            Box::new(secure),
            self.config.session.clone(),
            on_stream,
            self.tracker.clone(),
        );

        Ok(Arc::new(SessionHandle {
            session,
            peer: remote_peer,
            direction,
            observed_addr,
        }))
    }

    /// Negotiate and dispatch one inbound channel.
    async fn dispatch_channel(self: Arc<Self>, peer: PeerId, channel: Channel) {
        let matchers: Vec<ProtocolMatcher> = self
            .protocols
            .read()
            .expect("protocol lock")
            .iter()
            .map(|entry| entry.matcher.clone())
            .collect();

        let negotiated = timeout(
            NEGOTIATION_TIMEOUT,
            multistream::handle(&channel, &matchers),
        )
        .await;
        let protocol = match negotiated {
            Ok(Ok(protocol)) => protocol,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer.short(), error = %e, "channel negotiation failed");
                channel.reset().await;
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %peer.short(), "channel negotiation timed out");
                channel.reset().await;
                return;
            }
        };

        let handler = {
            let protocols = self.protocols.read().expect("protocol lock");
            protocols
                .iter()
                .find(|entry| entry.matcher.matches(&protocol))
                .map(|entry| entry.handler.clone())
        };
        match handler {
            Some(handler) => {
                tracing::debug!(peer = %peer.short(), protocol = %protocol, "channel dispatched");
                handler(channel, protocol, peer).await;
            }
            None => channel.reset().await,
        }
    }
}

/// Drops a pending-dial entry if the leading dial is cancelled, failing any
/// queued waiters instead of leaving them stuck.
struct DialGuard {
    inner: Arc<SwitchInner>,
    peer: PeerId,
    armed: bool,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let waiters = self
            .inner
            .pending_dials
            .lock()
            .expect("dial lock")
            .remove(&self.peer)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(Err("dial cancelled".to_string()));
        }
    }
}

pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    pub fn new(
        identity: Arc<Keypair>,
        transport: Arc<dyn Transport>,
        config: SwitchConfig,
        tracker: SharedTracker,
    ) -> Self {
        let local_peer = identity.peer_id();
        Self {
            inner: Arc::new(SwitchInner {
                identity,
                local_peer,
                transport,
                config,
                tracker,
                protocols: RwLock::new(Vec::new()),
                peers: DashMap::new(),
                pending_dials: StdMutex::new(HashMap::new()),
                conn_hooks: RwLock::new(Vec::new()),
                peer_hooks: RwLock::new(Vec::new()),
                listeners: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    /// Register an application protocol: a codec id (plus optional matcher
    /// predicate) and the handler for inbound channels negotiating it.
    pub fn register(&self, matcher: ProtocolMatcher, handler: ProtocolHandler) {
        self.inner
            .protocols
            .write()
            .expect("protocol lock")
            .push(ProtocolEntry { matcher, handler });
    }

    pub fn on_connection_event(&self, hook: ConnectionHook) {
        self.inner.conn_hooks.write().expect("hook lock").push(hook);
    }

    pub fn on_peer_event(&self, hook: PeerHook) {
        self.inner.peer_hooks.write().expect("hook lock").push(hook);
    }

    /// Peers with at least one live session.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of sessions currently open to `peer`.
    pub fn session_count(&self, peer: &PeerId) -> usize {
        self.inner.peers.get(peer).map(|s| s.len()).unwrap_or(0)
    }

    /// Start accepting on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, SwitchError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SwitchError::Closed);
        }
        let listener: Arc<dyn Listener> = Arc::from(self.inner.transport.listen(addr).await?);
        let local = listener.local_addr();
        self.inner
            .listeners
            .lock()
            .expect("listener lock")
            .push(listener.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(raw) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            let observed = raw.observed_addr;
                            match inner.upgrade(raw, None).await {
                                Ok(handle) => inner.add_session(handle),
                                Err(e) => {
                                    tracing::debug!(addr = %observed, error = %e, "inbound upgrade failed");
                                }
                            }
                        });
                    }
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
            tracing::debug!(addr = %local, "accept loop exited");
        });
        Ok(local)
    }

    /// Dial `peer`, reusing an existing session when one is live and
    /// coalescing concurrent dials to the same peer.
    pub async fn dial(&self, peer: &PeerInfo) -> Result<Arc<SessionHandle>, SwitchError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SwitchError::Closed);
        }
        if peer.peer_id == self.inner.local_peer {
            return Err(SwitchError::DialFailed {
                peer: peer.peer_id.clone(),
                reason: "cannot dial self".to_string(),
            });
        }
        if let Some(handle) = self.inner.existing(&peer.peer_id) {
            return Ok(handle);
        }

        // Join an in-flight dial or become the leader.
        let waiter = {
            let mut pending = self.inner.pending_dials.lock().expect("dial lock");
            if let Some(handle) = self.inner.existing(&peer.peer_id) {
                return Ok(handle);
            }
            match pending.get_mut(&peer.peer_id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    pending.insert(peer.peer_id.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(reason)) => Err(SwitchError::DialFailed {
                    peer: peer.peer_id.clone(),
                    reason,
                }),
                Err(_) => Err(SwitchError::DialFailed {
                    peer: peer.peer_id.clone(),
                    reason: "dial cancelled".to_string(),
                }),
            };
        }

        let mut guard = DialGuard {
            inner: self.inner.clone(),
            peer: peer.peer_id.clone(),
            armed: true,
        };
        let result = self.do_dial(peer).await;
        guard.armed = false;

        let waiters = self
            .inner
            .pending_dials
            .lock()
            .expect("dial lock")
            .remove(&peer.peer_id)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(match &result {
                Ok(handle) => Ok(handle.clone()),
                Err(e) => Err(e.to_string()),
            });
        }
        result
    }

    async fn do_dial(&self, peer: &PeerInfo) -> Result<Arc<SessionHandle>, SwitchError> {
        if peer.addrs.is_empty() {
            return Err(SwitchError::DialFailed {
                peer: peer.peer_id.clone(),
                reason: "no addresses".to_string(),
            });
        }
        let mut failures = Vec::new();
        for addr in &peer.addrs {
            tracing::debug!(peer = %peer.peer_id.short(), addr = %addr, "dialing");
            let raw = match self.inner.transport.dial(*addr).await {
                Ok(raw) => raw,
                Err(e) => {
                    failures.push(format!("{addr}: {e}"));
                    continue;
                }
            };
            match self.inner.upgrade(raw, Some(&peer.peer_id)).await {
                Ok(handle) => {
                    self.inner.add_session(handle.clone());
                    return Ok(handle);
                }
                Err(e) => failures.push(format!("{addr}: {e}")),
            }
        }
        Err(SwitchError::DialFailed {
            peer: peer.peer_id.clone(),
            reason: failures.join("; "),
        })
    }

    /// Dial and negotiate an application protocol on a fresh channel.
    pub async fn dial_protocol(
        &self,
        peer: &PeerInfo,
        protocols: &[&str],
    ) -> Result<(Channel, String), SwitchError> {
        let session = self.dial(peer).await?;
        self.open_stream(&session, protocols).await
    }

    /// Open a channel on an existing session and negotiate a protocol.
    pub async fn open_stream(
        &self,
        session: &SessionHandle,
        protocols: &[&str],
    ) -> Result<(Channel, String), SwitchError> {
        let name = protocols.first().copied().unwrap_or("");
        let channel = session.open_channel(name).await?;
        match timeout(NEGOTIATION_TIMEOUT, multistream::select(&channel, protocols)).await {
            Ok(Ok(protocol)) => Ok((channel, protocol)),
            Ok(Err(e)) => {
                channel.reset().await;
                Err(e.into())
            }
            Err(_) => {
                channel.reset().await;
                Err(SwitchError::Negotiation(NegotiationError::Failed(
                    "negotiation timed out".to_string(),
                )))
            }
        }
    }

    /// Close every session to `peer`, resetting all their channels.
    pub async fn disconnect(&self, peer: &PeerId) {
        let sessions = self
            .inner
            .peers
            .get(peer)
            .map(|s| s.clone())
            .unwrap_or_default();
        for handle in sessions {
            handle.session.close().await;
            self.inner.remove_session(&handle);
        }
    }

    /// Stop listeners, disconnect every peer, and settle accounting.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for listener in self.inner.listeners.lock().expect("listener lock").drain(..) {
            listener.close();
        }
        let peers: Vec<PeerId> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.disconnect(&peer).await;
        }
        tracing::info!("switch closed");
    }
}
