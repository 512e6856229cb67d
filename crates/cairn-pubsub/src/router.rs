//! The pubsub router core and the FloodSub variant.
//!
//! The core owns everything the variants share: the peer table, local topic
//! subscriptions with their handlers, validators, observers, the seen-cache,
//! signing, and the per-peer receive loops. A strategy object supplies the
//! variant-specific pieces — who to forward to, and what to do with control
//! blocks. FloodSub's strategy is the trivial one: forward to every peer
//! subscribed to the topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use prost::Message as _;
use tokio_util::sync::CancellationToken;

use cairn_core::stream::read_lp;
use cairn_core::{ByteStream, Keypair, PeerId};
use cairn_net::{Channel, PeerEvent, ProtocolMatcher, Switch};

use crate::cache::{TimedCache, DEFAULT_TTL};
use crate::peer::PubSubPeer;
use crate::rpc::{
    fingerprint, sign_message, verify_message, ControlMessage, Message, Rpc, SubOpts, MAX_RPC_SIZE,
};

pub const FLOODSUB_ID: &str = "/floodsub/1.0.0";

/// Invoked for every accepted message on a subscribed topic.
pub type TopicHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async predicate deciding whether a message on a topic is acceptable.
pub type Validator = Arc<dyn Fn(Message) -> BoxFuture<'static, bool> + Send + Sync>;

/// Inspects and possibly transforms a message; observers chain in
/// registration order.
pub type MessageObserver = Arc<dyn Fn(Message) -> BoxFuture<'static, Message> + Send + Sync>;

/// Overrides the default (SHA-256 of the encoded message) message id.
pub type MessageIdFn = Arc<dyn Fn(&Message) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub struct PubSubConfig {
    /// Sign outgoing messages with the identity key.
    pub sign: bool,
    /// Verify signatures on incoming messages that carry one.
    pub verify: bool,
    /// Deliver our own publishes to local handlers.
    pub trigger_self: bool,
    pub send_timeout: Duration,
    pub cache_ttl: Duration,
    pub msg_id_fn: Option<MessageIdFn>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            sign: true,
            verify: true,
            trigger_self: true,
            send_timeout: Duration::from_secs(10),
            cache_ttl: DEFAULT_TTL,
            msg_id_fn: None,
        }
    }
}

impl std::fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("sign", &self.sign)
            .field("verify", &self.verify)
            .field("trigger_self", &self.trigger_self)
            .field("send_timeout", &self.send_timeout)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

/// Variant-specific routing behavior.
#[async_trait]
pub(crate) trait Strategy: Send + Sync {
    /// Peers an accepted or published message should be forwarded to.
    fn relay_targets(
        &self,
        core: &RouterCore,
        topics: &[String],
        exclude: Option<&PeerId>,
    ) -> Vec<Arc<PubSubPeer>>;

    /// Handle a control block from `peer`.
    async fn handle_control(&self, core: &RouterCore, peer: &Arc<PubSubPeer>, ctl: ControlMessage);

    /// A message was accepted; variants may cache it for gossip.
    fn cache_message(&self, id: Vec<u8>, msg: &Message);

    async fn on_local_subscribe(&self, core: &RouterCore, topic: &str);

    async fn on_local_unsubscribe(&self, core: &RouterCore, topic: &str);

    fn on_peer_removed(&self, peer: &PeerId);
}

pub struct RouterCore {
    switch: Arc<Switch>,
    keypair: Arc<Keypair>,
    local_peer: PeerId,
    config: PubSubConfig,
    protocols: Vec<String>,
    strategy: OnceLock<Arc<dyn Strategy>>,
    peers: DashMap<PeerId, Arc<PubSubPeer>>,
    topics: RwLock<HashMap<String, Vec<TopicHandler>>>,
    validators: RwLock<HashMap<String, Vec<Validator>>>,
    recv_observers: RwLock<Vec<MessageObserver>>,
    send_observers: RwLock<Vec<MessageObserver>>,
    /// Message ids this node has already accepted or published.
    seen: StdMutex<TimedCache>,
    seqno: AtomicU64,
    cancel: CancellationToken,
}

impl RouterCore {
    pub(crate) fn new(
        switch: Arc<Switch>,
        keypair: Arc<Keypair>,
        config: PubSubConfig,
        protocols: Vec<String>,
    ) -> Arc<Self> {
        let local_peer = keypair.peer_id();
        let cache_ttl = config.cache_ttl;
        Arc::new(Self {
            switch,
            keypair,
            local_peer,
            config,
            protocols,
            strategy: OnceLock::new(),
            peers: DashMap::new(),
            topics: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            recv_observers: RwLock::new(Vec::new()),
            send_observers: RwLock::new(Vec::new()),
            seen: StdMutex::new(TimedCache::new(cache_ttl)),
            seqno: AtomicU64::new(rand::random()),
            cancel: CancellationToken::new(),
        })
    }

    /// Install the strategy and wire the router into the switch: one
    /// protocol registration per codec, plus the peer lifecycle hook.
    pub(crate) fn attach(self: &Arc<Self>, strategy: Arc<dyn Strategy>) {
        if self.strategy.set(strategy).is_err() {
            unreachable!("router strategy attached twice");
        }

        let weak = Arc::downgrade(self);
        for protocol in &self.protocols {
            let weak = weak.clone();
            self.switch.register(
                ProtocolMatcher::exact(protocol.clone()),
                Arc::new(move |channel, negotiated, peer| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(core) = weak.upgrade() {
                            core.handle_stream(peer, negotiated, channel).await;
                        }
                    })
                }),
            );
        }

        let weak = Arc::downgrade(self);
        self.switch.on_peer_event(Arc::new(move |event| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                match event {
                    PeerEvent::Joined(peer) => core.attach_peer(peer).await,
                    PeerEvent::Left(peer) => core.remove_peer(&peer).await,
                }
            })
        }));
    }

    fn strategy(&self) -> &Arc<dyn Strategy> {
        self.strategy.get().expect("strategy installed at construction")
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub(crate) fn switch(&self) -> &Arc<Switch> {
        &self.switch
    }

    pub(crate) fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn protocol_strs(&self) -> Vec<&str> {
        self.protocols.iter().map(String::as_str).collect()
    }

    // ── Peer table ───────────────────────────────────────────────────────────

    fn get_or_create_peer(&self, id: &PeerId) -> Arc<PubSubPeer> {
        self.peers
            .entry(id.clone())
            .or_insert_with(|| Arc::new(PubSubPeer::new(id.clone(), self.config.cache_ttl)))
            .clone()
    }

    pub(crate) fn peer(&self, id: &PeerId) -> Option<Arc<PubSubPeer>> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peer ids known to subscribe to `topic`.
    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.peers_subscribed_to(topic)
            .into_iter()
            .map(|peer| peer.id().clone())
            .collect()
    }

    /// Peers known to subscribe to `topic`.
    pub(crate) fn peers_subscribed_to(&self, topic: &str) -> Vec<Arc<PubSubPeer>> {
        self.peers
            .iter()
            .filter(|entry| entry.subscribed_to(topic))
            .map(|entry| entry.clone())
            .collect()
    }

    async fn attach_peer(self: &Arc<Self>, id: PeerId) {
        if id == self.local_peer {
            return;
        }
        tracing::debug!(peer = %id.short(), "pubsub peer joined");
        let peer = self.get_or_create_peer(&id);

        // Tell the newcomer what we subscribe to.
        let topics: Vec<String> = self.topics.read().expect("topic lock").keys().cloned().collect();
        if topics.is_empty() {
            return;
        }
        let rpc = Rpc {
            subscriptions: topics
                .into_iter()
                .map(|topic| SubOpts {
                    subscribe: Some(true),
                    topic_id: Some(topic),
                })
                .collect(),
            ..Default::default()
        };
        if let Err(e) = peer
            .send(
                &self.switch,
                &self.protocol_strs(),
                &rpc.encode_to_vec(),
                None,
                self.config.send_timeout,
            )
            .await
        {
            tracing::debug!(peer = %id.short(), error = %e, "subscription announce failed");
        }
    }

    async fn remove_peer(&self, id: &PeerId) {
        if let Some((_, peer)) = self.peers.remove(id) {
            tracing::debug!(peer = %id.short(), "pubsub peer left");
            peer.shutdown().await;
            self.strategy().on_peer_removed(id);
        }
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    /// Per-peer read loop, one per inbound pubsub channel.
    async fn handle_stream(self: &Arc<Self>, peer_id: PeerId, negotiated: String, channel: Channel) {
        let peer = self.get_or_create_peer(&peer_id);
        peer.set_codec(&negotiated);
        tracing::debug!(peer = %peer_id.short(), protocol = %negotiated, "pubsub stream open");

        loop {
            let bytes = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = read_lp(&channel, MAX_RPC_SIZE) => match read {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::debug!(peer = %peer_id.short(), error = %e, "pubsub stream ended");
                        break;
                    }
                },
            };

            let fp = fingerprint(&bytes);
            if peer.recv_cache.lock().expect("cache lock").contains(&fp) {
                continue;
            }
            let rpc = match Rpc::decode(bytes.as_slice()) {
                Ok(rpc) => rpc,
                Err(e) => {
                    tracing::debug!(peer = %peer_id.short(), error = %e, "undecodable rpc");
                    break;
                }
            };
            self.process_rpc(&peer, rpc).await;
            peer.recv_cache.lock().expect("cache lock").insert(fp);
        }
        if let Err(e) = channel.close().await {
            tracing::trace!(error = %e, "pubsub stream close");
        }
    }

    async fn process_rpc(self: &Arc<Self>, peer: &Arc<PubSubPeer>, rpc: Rpc) {
        for sub in rpc.subscriptions {
            let Some(topic) = sub.topic_id else { continue };
            let subscribe = sub.subscribe.unwrap_or(false);
            tracing::debug!(peer = %peer.id().short(), topic = %topic, subscribe, "subscription update");
            peer.set_subscription(&topic, subscribe);
        }
        for msg in rpc.publish {
            self.process_message(peer, msg).await;
        }
        if let Some(control) = rpc.control {
            self.strategy().handle_control(self, peer, control).await;
        }
    }

    async fn process_message(self: &Arc<Self>, peer: &Arc<PubSubPeer>, msg: Message) {
        let msg = self.apply_observers(&self.recv_observers, msg).await;

        let id = self.message_id(&msg);
        let id_fp = fingerprint(&id);
        if !self.seen.lock().expect("seen lock").insert(id_fp) {
            return;
        }

        if self.config.verify && (msg.signature.is_some() || msg.key.is_some()) {
            if let Err(e) = verify_message(&msg) {
                tracing::debug!(peer = %peer.id().short(), error = %e, "dropping badly signed message");
                return;
            }
        }

        if !self.validate(&msg).await {
            tracing::debug!(peer = %peer.id().short(), "message rejected by validators");
            return;
        }

        self.deliver_local(&msg).await;
        self.strategy().cache_message(id, &msg);
        self.relay(msg, Some(peer.id())).await;
    }

    /// Run all validators registered for the message's topics concurrently;
    /// a panic counts as rejection.
    async fn validate(&self, msg: &Message) -> bool {
        let validators: Vec<Validator> = {
            let map = self.validators.read().expect("validator lock");
            msg.topic_ids
                .iter()
                .filter_map(|topic| map.get(topic))
                .flatten()
                .cloned()
                .collect()
        };
        if validators.is_empty() {
            return true;
        }
        let checks: Vec<_> = validators
            .into_iter()
            .map(|validator| tokio::spawn(validator(msg.clone())))
            .collect();
        for check in futures::future::join_all(checks).await {
            match check {
                Ok(true) => {}
                Ok(false) | Err(_) => return false,
            }
        }
        true
    }

    async fn deliver_local(&self, msg: &Message) {
        let handlers: Vec<TopicHandler> = {
            let topics = self.topics.read().expect("topic lock");
            msg.topic_ids
                .iter()
                .filter_map(|topic| topics.get(topic))
                .flatten()
                .cloned()
                .collect()
        };
        for handler in handlers {
            handler(msg.clone()).await;
        }
    }

    /// Forward a message to the strategy's targets. Returns how many peers
    /// were actually written to.
    async fn relay(self: &Arc<Self>, msg: Message, exclude: Option<&PeerId>) -> usize {
        let msg = self.apply_observers(&self.send_observers, msg).await;
        let topics = msg.topic_ids.clone();
        let fp = fingerprint(&self.message_id(&msg));
        let rpc = Rpc {
            publish: vec![msg],
            ..Default::default()
        };
        let bytes = rpc.encode_to_vec();
        let protocols = self.protocol_strs();

        let mut sent = 0;
        for peer in self.strategy().relay_targets(self, &topics, exclude) {
            match peer
                .send(&self.switch, &protocols, &bytes, Some(fp), self.config.send_timeout)
                .await
            {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(peer = %peer.id().short(), error = %e, "forward failed");
                }
            }
        }
        sent
    }

    // ── Public surface ───────────────────────────────────────────────────────

    fn message_id(&self, msg: &Message) -> Vec<u8> {
        match &self.config.msg_id_fn {
            Some(custom) => custom(msg),
            None => fingerprint(&msg.encode_to_vec()).to_vec(),
        }
    }

    fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::SeqCst)
    }

    pub fn local_topics(&self) -> Vec<String> {
        self.topics.read().expect("topic lock").keys().cloned().collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().expect("topic lock").contains_key(topic)
    }

    /// Add a handler for `topic`, announcing the subscription to every
    /// known peer the first time.
    pub async fn subscribe(self: &Arc<Self>, topic: &str, handler: TopicHandler) {
        let newly = {
            let mut topics = self.topics.write().expect("topic lock");
            let handlers = topics.entry(topic.to_string()).or_default();
            handlers.push(handler);
            handlers.len() == 1
        };
        if newly {
            tracing::info!(topic, "subscribed");
            self.strategy().on_local_subscribe(self, topic).await;
            self.announce_subscription(topic, true).await;
        }
    }

    /// Drop all handlers for `topic` and tell peers.
    pub async fn unsubscribe(self: &Arc<Self>, topic: &str) {
        let removed = self
            .topics
            .write()
            .expect("topic lock")
            .remove(topic)
            .is_some();
        if removed {
            tracing::info!(topic, "unsubscribed");
            self.strategy().on_local_unsubscribe(self, topic).await;
            self.announce_subscription(topic, false).await;
        }
    }

    async fn announce_subscription(&self, topic: &str, subscribe: bool) {
        let rpc = Rpc {
            subscriptions: vec![SubOpts {
                subscribe: Some(subscribe),
                topic_id: Some(topic.to_string()),
            }],
            ..Default::default()
        };
        let bytes = rpc.encode_to_vec();
        let protocols = self.protocol_strs();
        let peers: Vec<Arc<PubSubPeer>> = self.peers.iter().map(|p| p.clone()).collect();
        for peer in peers {
            if let Err(e) = peer
                .send(&self.switch, &protocols, &bytes, None, self.config.send_timeout)
                .await
            {
                tracing::debug!(peer = %peer.id().short(), error = %e, "subscription update failed");
            }
        }
    }

    /// Publish `data` on `topic`. Returns the number of peers written to.
    pub async fn publish(self: &Arc<Self>, topic: &str, data: &[u8]) -> usize {
        let mut msg = Message {
            from: Some(self.local_peer.as_bytes().to_vec()),
            data: Some(data.to_vec()),
            seqno: Some(self.next_seqno().to_be_bytes().to_vec()),
            topic_ids: vec![topic.to_string()],
            signature: None,
            key: None,
        };
        if self.config.sign {
            sign_message(&mut msg, &self.keypair);
        }

        // Remember our own message so a flood echo is not redelivered.
        let id = self.message_id(&msg);
        self.seen.lock().expect("seen lock").insert(fingerprint(&id));
        self.strategy().cache_message(id, &msg);

        if self.config.trigger_self && self.is_subscribed(topic) {
            self.deliver_local(&msg).await;
        }

        let sent = self.relay(msg, None).await;
        tracing::debug!(topic, peers = sent, "published");
        sent
    }

    // ── Validators & observers ───────────────────────────────────────────────

    pub fn add_validator(&self, topic: &str, validator: Validator) {
        self.validators
            .write()
            .expect("validator lock")
            .entry(topic.to_string())
            .or_default()
            .push(validator);
    }

    /// Remove every validator registered for `topic`.
    pub fn remove_validators(&self, topic: &str) {
        self.validators.write().expect("validator lock").remove(topic);
    }

    pub fn add_recv_observer(&self, observer: MessageObserver) {
        self.recv_observers.write().expect("observer lock").push(observer);
    }

    pub fn add_send_observer(&self, observer: MessageObserver) {
        self.send_observers.write().expect("observer lock").push(observer);
    }

    async fn apply_observers(
        &self,
        observers: &RwLock<Vec<MessageObserver>>,
        msg: Message,
    ) -> Message {
        let observers: Vec<MessageObserver> =
            observers.read().expect("observer lock").iter().cloned().collect();
        let mut msg = msg;
        for observer in observers {
            msg = observer(msg).await;
        }
        msg
    }

    /// Build and send a control-only RPC to one peer.
    pub(crate) async fn send_control(&self, peer: &Arc<PubSubPeer>, control: ControlMessage) {
        let rpc = Rpc {
            control: Some(control),
            ..Default::default()
        };
        if let Err(e) = peer
            .send(
                &self.switch,
                &self.protocol_strs(),
                &rpc.encode_to_vec(),
                None,
                self.config.send_timeout,
            )
            .await
        {
            tracing::debug!(peer = %peer.id().short(), error = %e, "control send failed");
        }
    }

    /// Send a plain RPC (gossip replies) to one peer.
    pub(crate) async fn send_rpc(&self, peer: &Arc<PubSubPeer>, rpc: Rpc) {
        if let Err(e) = peer
            .send(
                &self.switch,
                &self.protocol_strs(),
                &rpc.encode_to_vec(),
                None,
                self.config.send_timeout,
            )
            .await
        {
            tracing::debug!(peer = %peer.id().short(), error = %e, "rpc send failed");
        }
    }

    pub(crate) fn seen_contains(&self, id: &[u8]) -> bool {
        self.seen
            .lock()
            .expect("seen lock")
            .contains(&fingerprint(id))
    }

    /// Stop read loops and drop send connections.
    pub async fn close(&self) {
        self.cancel.cancel();
        let peers: Vec<Arc<PubSubPeer>> = self.peers.iter().map(|p| p.clone()).collect();
        self.peers.clear();
        for peer in peers {
            peer.shutdown().await;
        }
    }
}

// ── FloodSub ──────────────────────────────────────────────────────────────────

struct FloodStrategy;

#[async_trait]
impl Strategy for FloodStrategy {
    fn relay_targets(
        &self,
        core: &RouterCore,
        topics: &[String],
        exclude: Option<&PeerId>,
    ) -> Vec<Arc<PubSubPeer>> {
        let mut seen = std::collections::HashSet::new();
        let mut targets = Vec::new();
        for topic in topics {
            for peer in core.peers_subscribed_to(topic) {
                if Some(peer.id()) == exclude {
                    continue;
                }
                if seen.insert(peer.id().clone()) {
                    targets.push(peer);
                }
            }
        }
        targets
    }

    async fn handle_control(
        &self,
        _core: &RouterCore,
        peer: &Arc<PubSubPeer>,
        _ctl: ControlMessage,
    ) {
        tracing::trace!(peer = %peer.id().short(), "ignoring control block on floodsub");
    }

    fn cache_message(&self, _id: Vec<u8>, _msg: &Message) {}

    async fn on_local_subscribe(&self, _core: &RouterCore, _topic: &str) {}

    async fn on_local_unsubscribe(&self, _core: &RouterCore, _topic: &str) {}

    fn on_peer_removed(&self, _peer: &PeerId) {}
}

/// Flood router: every message goes to every subscribed peer.
pub struct FloodSub {
    core: Arc<RouterCore>,
}

impl FloodSub {
    pub fn new(switch: Arc<Switch>, keypair: Arc<Keypair>, config: PubSubConfig) -> Arc<Self> {
        let core = RouterCore::new(switch, keypair, config, vec![FLOODSUB_ID.to_string()]);
        core.attach(Arc::new(FloodStrategy));
        Arc::new(Self { core })
    }

    pub fn core(&self) -> &Arc<RouterCore> {
        &self.core
    }
}

impl std::ops::Deref for FloodSub {
    type Target = Arc<RouterCore>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}
