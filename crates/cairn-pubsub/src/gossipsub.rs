//! GossipSub: mesh-based routing over the shared router core.
//!
//! Each subscribed topic keeps a mesh of peers the node forwards full
//! messages to, maintained with GRAFT/PRUNE control messages. A heartbeat
//! fills thin meshes, trims fat ones, and gossips IHAVE digests of recently
//! seen messages to peers outside the mesh, who fetch what they miss with
//! IWANT. Send and dedup contracts are identical to FloodSub.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;

use cairn_core::{Keypair, PeerId};
use cairn_net::Switch;

use crate::peer::PubSubPeer;
use crate::router::{PubSubConfig, RouterCore, Strategy, FLOODSUB_ID};
use crate::rpc::{ControlGraft, ControlIHave, ControlIWant, ControlMessage, ControlPrune, Message, Rpc};

pub const GOSSIPSUB_ID: &str = "/meshsub/1.0.0";

#[derive(Debug, Clone)]
pub struct GossipsubConfig {
    /// Target mesh degree.
    pub mesh_n: usize,
    /// Mesh is refilled below this.
    pub mesh_n_low: usize,
    /// Mesh is trimmed above this.
    pub mesh_n_high: usize,
    pub heartbeat_interval: Duration,
    /// Heartbeats of message history retained for IWANT answering.
    pub history_length: usize,
    /// Heartbeats of history advertised in IHAVE gossip.
    pub history_gossip: usize,
}

impl Default for GossipsubConfig {
    fn default() -> Self {
        Self {
            mesh_n: 6,
            mesh_n_low: 4,
            mesh_n_high: 12,
            heartbeat_interval: Duration::from_secs(1),
            history_length: 5,
            history_gossip: 3,
        }
    }
}

/// Sliding-window cache of full messages for IWANT answering.
struct MessageWindow {
    msgs: HashMap<Vec<u8>, Message>,
    /// One entry per heartbeat, newest first: (id, topics) pairs.
    history: VecDeque<Vec<(Vec<u8>, Vec<String>)>>,
    length: usize,
}

impl MessageWindow {
    fn new(length: usize) -> Self {
        let mut history = VecDeque::with_capacity(length + 1);
        history.push_front(Vec::new());
        Self {
            msgs: HashMap::new(),
            history,
            length,
        }
    }

    fn put(&mut self, id: Vec<u8>, msg: &Message) {
        if self.msgs.contains_key(&id) {
            return;
        }
        self.msgs.insert(id.clone(), msg.clone());
        if let Some(window) = self.history.front_mut() {
            window.push((id, msg.topic_ids.clone()));
        }
    }

    fn get(&self, id: &[u8]) -> Option<&Message> {
        self.msgs.get(id)
    }

    fn contains(&self, id: &[u8]) -> bool {
        self.msgs.contains_key(id)
    }

    /// Ids with `topic` in the newest `windows` heartbeats.
    fn ids_for_topic(&self, topic: &str, windows: usize) -> Vec<Vec<u8>> {
        self.history
            .iter()
            .take(windows)
            .flatten()
            .filter(|(_, topics)| topics.iter().any(|t| t == topic))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Advance one heartbeat, dropping messages that fell off the window.
    fn shift(&mut self) {
        self.history.push_front(Vec::new());
        while self.history.len() > self.length {
            if let Some(expired) = self.history.pop_back() {
                for (id, _) in expired {
                    self.msgs.remove(&id);
                }
            }
        }
    }
}

struct GossipState {
    config: GossipsubConfig,
    /// Per-topic mesh membership.
    mesh: DashMap<String, HashSet<PeerId>>,
    window: StdMutex<MessageWindow>,
}

impl GossipState {
    fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.mesh
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct GossipStrategy {
    state: Arc<GossipState>,
}

#[async_trait]
impl Strategy for GossipStrategy {
    fn relay_targets(
        &self,
        core: &RouterCore,
        topics: &[String],
        exclude: Option<&PeerId>,
    ) -> Vec<Arc<PubSubPeer>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for topic in topics {
            let members = self.state.mesh_peers(topic);
            if members.is_empty() {
                // No mesh yet (just subscribed, or publishing without
                // subscribing): flood to every subscribed peer instead.
                for peer in core.peers_subscribed_to(topic) {
                    if Some(peer.id()) != exclude && seen.insert(peer.id().clone()) {
                        targets.push(peer);
                    }
                }
                continue;
            }
            for id in members {
                if Some(&id) == exclude || !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(peer) = core.peer(&id) {
                    targets.push(peer);
                }
            }
        }
        targets
    }

    async fn handle_control(&self, core: &RouterCore, peer: &Arc<PubSubPeer>, ctl: ControlMessage) {
        let mut reply = ControlMessage::default();
        let mut wanted_msgs: Vec<Message> = Vec::new();

        for graft in ctl.graft {
            let Some(topic) = graft.topic_id else { continue };
            if core.is_subscribed(&topic) {
                tracing::debug!(peer = %peer.id().short(), topic = %topic, "grafted into mesh");
                self.state
                    .mesh
                    .entry(topic)
                    .or_default()
                    .insert(peer.id().clone());
            } else {
                // Not meshing on a topic we do not subscribe to.
                reply.prune.push(ControlPrune {
                    topic_id: Some(topic),
                });
            }
        }

        for prune in ctl.prune {
            let Some(topic) = prune.topic_id else { continue };
            if let Some(mut members) = self.state.mesh.get_mut(&topic) {
                members.remove(peer.id());
            }
        }

        for ihave in ctl.ihave {
            let window = self.state.window.lock().expect("window lock");
            let missing: Vec<Vec<u8>> = ihave
                .message_ids
                .into_iter()
                .filter(|id| !window.contains(id) && !core.seen_contains(id))
                .collect();
            if !missing.is_empty() {
                reply.iwant.push(ControlIWant {
                    message_ids: missing,
                });
            }
        }

        for iwant in ctl.iwant {
            let window = self.state.window.lock().expect("window lock");
            for id in iwant.message_ids {
                if let Some(msg) = window.get(&id) {
                    wanted_msgs.push(msg.clone());
                }
            }
        }

        if reply != ControlMessage::default() {
            core.send_control(peer, reply).await;
        }
        if !wanted_msgs.is_empty() {
            core.send_rpc(
                peer,
                Rpc {
                    publish: wanted_msgs,
                    ..Default::default()
                },
            )
            .await;
        }
    }

    fn cache_message(&self, id: Vec<u8>, msg: &Message) {
        self.state.window.lock().expect("window lock").put(id, msg);
    }

    async fn on_local_subscribe(&self, core: &RouterCore, topic: &str) {
        // Seed the mesh from peers already subscribed to the topic.
        let mut candidates = core.peers_subscribed_to(topic);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.state.config.mesh_n);

        let mut members = HashSet::new();
        for peer in &candidates {
            members.insert(peer.id().clone());
        }
        self.state.mesh.insert(topic.to_string(), members);

        for peer in candidates {
            core.send_control(
                &peer,
                ControlMessage {
                    graft: vec![ControlGraft {
                        topic_id: Some(topic.to_string()),
                    }],
                    ..Default::default()
                },
            )
            .await;
        }
    }

    async fn on_local_unsubscribe(&self, core: &RouterCore, topic: &str) {
        let Some((_, members)) = self.state.mesh.remove(topic) else {
            return;
        };
        for id in members {
            if let Some(peer) = core.peer(&id) {
                core.send_control(
                    &peer,
                    ControlMessage {
                        prune: vec![ControlPrune {
                            topic_id: Some(topic.to_string()),
                        }],
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }

    fn on_peer_removed(&self, peer: &PeerId) {
        for mut entry in self.state.mesh.iter_mut() {
            entry.value_mut().remove(peer);
        }
    }
}

/// Mesh router. Protocol `/meshsub/1.0.0`, with floodsub as a fallback
/// codec for peers that only speak that.
pub struct GossipSub {
    core: Arc<RouterCore>,
    state: Arc<GossipState>,
}

impl GossipSub {
    pub fn new(
        switch: Arc<Switch>,
        keypair: Arc<Keypair>,
        config: PubSubConfig,
        gossip: GossipsubConfig,
    ) -> Arc<Self> {
        let core = RouterCore::new(
            switch,
            keypair,
            config,
            vec![GOSSIPSUB_ID.to_string(), FLOODSUB_ID.to_string()],
        );
        let state = Arc::new(GossipState {
            window: StdMutex::new(MessageWindow::new(gossip.history_length)),
            mesh: DashMap::new(),
            config: gossip,
        });
        core.attach(Arc::new(GossipStrategy {
            state: state.clone(),
        }));

        let router = Arc::new(Self {
            core: core.clone(),
            state: state.clone(),
        });
        tokio::spawn(Self::heartbeat(Arc::downgrade(&core), state, core.cancel_token()));
        router
    }

    pub fn core(&self) -> &Arc<RouterCore> {
        &self.core
    }

    /// Current mesh members for a topic (observability / tests).
    pub fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.state.mesh_peers(topic)
    }

    async fn heartbeat(
        core: std::sync::Weak<RouterCore>,
        state: Arc<GossipState>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut interval = tokio::time::interval(state.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(core) = core.upgrade() else { return };
            Self::maintain_meshes(&core, &state).await;
            Self::emit_gossip(&core, &state).await;
            state.window.lock().expect("window lock").shift();
        }
    }

    /// Fill thin meshes with GRAFT, trim fat ones with PRUNE.
    async fn maintain_meshes(core: &Arc<RouterCore>, state: &Arc<GossipState>) {
        for topic in core.local_topics() {
            let members = state.mesh_peers(&topic);

            if members.len() < state.config.mesh_n_low {
                let current: HashSet<&PeerId> = members.iter().collect();
                let mut candidates: Vec<Arc<PubSubPeer>> = core
                    .peers_subscribed_to(&topic)
                    .into_iter()
                    .filter(|peer| !current.contains(peer.id()))
                    .collect();
                candidates.shuffle(&mut rand::thread_rng());
                candidates.truncate(state.config.mesh_n.saturating_sub(members.len()));

                for peer in candidates {
                    state
                        .mesh
                        .entry(topic.clone())
                        .or_default()
                        .insert(peer.id().clone());
                    tracing::debug!(peer = %peer.id().short(), topic = %topic, "grafting");
                    core.send_control(
                        &peer,
                        ControlMessage {
                            graft: vec![ControlGraft {
                                topic_id: Some(topic.clone()),
                            }],
                            ..Default::default()
                        },
                    )
                    .await;
                }
            } else if members.len() > state.config.mesh_n_high {
                let mut members = members;
                members.shuffle(&mut rand::thread_rng());
                let excess = members.split_off(state.config.mesh_n);
                state
                    .mesh
                    .insert(topic.clone(), members.into_iter().collect());

                for id in excess {
                    let Some(peer) = core.peer(&id) else { continue };
                    tracing::debug!(peer = %id.short(), topic = %topic, "pruning");
                    core.send_control(
                        &peer,
                        ControlMessage {
                            prune: vec![ControlPrune {
                                topic_id: Some(topic.clone()),
                            }],
                            ..Default::default()
                        },
                    )
                    .await;
                }
            }
        }
    }

    /// Advertise recent message ids to peers outside the mesh.
    async fn emit_gossip(core: &Arc<RouterCore>, state: &Arc<GossipState>) {
        for topic in core.local_topics() {
            let ids = state
                .window
                .lock()
                .expect("window lock")
                .ids_for_topic(&topic, state.config.history_gossip);
            if ids.is_empty() {
                continue;
            }
            let mesh: HashSet<PeerId> = state.mesh_peers(&topic).into_iter().collect();
            let mut outside: Vec<Arc<PubSubPeer>> = core
                .peers_subscribed_to(&topic)
                .into_iter()
                .filter(|peer| !mesh.contains(peer.id()))
                .collect();
            outside.shuffle(&mut rand::thread_rng());
            outside.truncate(state.config.mesh_n);

            for peer in outside {
                core.send_control(
                    &peer,
                    ControlMessage {
                        ihave: vec![ControlIHave {
                            topic_id: Some(topic.clone()),
                            message_ids: ids.clone(),
                        }],
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }
}

impl std::ops::Deref for GossipSub {
    type Target = Arc<RouterCore>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, data: &[u8]) -> Message {
        Message {
            from: None,
            data: Some(data.to_vec()),
            seqno: Some(1u64.to_be_bytes().to_vec()),
            topic_ids: vec![topic.to_string()],
            signature: None,
            key: None,
        }
    }

    #[test]
    fn window_retains_and_expires() {
        let mut window = MessageWindow::new(3);
        window.put(vec![1], &msg("a", b"one"));
        assert!(window.contains(&[1]));

        // Three shifts push the entry out of the window.
        window.shift();
        window.shift();
        assert!(window.contains(&[1]));
        window.shift();
        assert!(!window.contains(&[1]));
        assert!(window.get(&[1]).is_none());
    }

    #[test]
    fn window_ids_respect_topic_and_depth() {
        let mut window = MessageWindow::new(5);
        window.put(vec![1], &msg("a", b"one"));
        window.shift();
        window.put(vec![2], &msg("a", b"two"));
        window.put(vec![3], &msg("b", b"three"));

        let recent_a = window.ids_for_topic("a", 1);
        assert_eq!(recent_a, vec![vec![2]]);

        let deeper_a = window.ids_for_topic("a", 2);
        assert_eq!(deeper_a.len(), 2);

        let b = window.ids_for_topic("b", 2);
        assert_eq!(b, vec![vec![3]]);
    }

    #[test]
    fn duplicate_put_is_ignored() {
        let mut window = MessageWindow::new(2);
        window.put(vec![9], &msg("t", b"x"));
        window.put(vec![9], &msg("t", b"x"));
        assert_eq!(window.ids_for_topic("t", 1).len(), 1);
    }
}
