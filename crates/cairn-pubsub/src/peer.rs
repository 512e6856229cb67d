//! Per-peer pubsub state: the lazily opened send channel, subscription set,
//! and the two deduplication caches.

use std::collections::HashSet;
use std::sync::{Mutex as StdMutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

use cairn_core::stream::{write_lp, ByteStream, StreamError};
use cairn_core::{PeerId, PeerInfo};
use cairn_net::{Channel, Switch, SwitchError};

use crate::cache::TimedCache;

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("send timed out")]
    Timeout,
}

pub struct PubSubPeer {
    id: PeerId,
    /// Protocol negotiated with this peer (set on first contact).
    codec: RwLock<Option<String>>,
    /// Muxed channel used for sends; recycled on failure.
    send_conn: Mutex<Option<Channel>>,
    /// Fingerprints of messages already sent to this peer.
    pub(crate) sent_cache: StdMutex<TimedCache>,
    /// Fingerprints of RPCs and messages already received from this peer.
    pub(crate) recv_cache: StdMutex<TimedCache>,
    /// Topics the peer has told us it subscribes to.
    topics: RwLock<HashSet<String>>,
}

impl PubSubPeer {
    pub fn new(id: PeerId, cache_ttl: Duration) -> Self {
        Self {
            id,
            codec: RwLock::new(None),
            send_conn: Mutex::new(None),
            sent_cache: StdMutex::new(TimedCache::new(cache_ttl)),
            recv_cache: StdMutex::new(TimedCache::new(cache_ttl)),
            topics: RwLock::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn codec(&self) -> Option<String> {
        self.codec.read().expect("codec lock").clone()
    }

    pub fn set_codec(&self, codec: &str) {
        let mut slot = self.codec.write().expect("codec lock");
        if slot.is_none() {
            *slot = Some(codec.to_string());
        }
    }

    pub fn subscribed_to(&self, topic: &str) -> bool {
        self.topics.read().expect("topic lock").contains(topic)
    }

    pub fn set_subscription(&self, topic: &str, subscribe: bool) {
        let mut topics = self.topics.write().expect("topic lock");
        if subscribe {
            topics.insert(topic.to_string());
        } else {
            topics.remove(topic);
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().expect("topic lock").len()
    }

    /// Is the send connection currently usable?
    pub async fn connected(&self) -> bool {
        match self.send_conn.lock().await.as_ref() {
            Some(conn) => !conn.is_closed() && !conn.at_eof(),
            None => false,
        }
    }

    /// Best-effort RPC send.
    ///
    /// With `fp` set, the send is skipped (returning Ok(false)) when the
    /// fingerprint is already in the sent cache. A broken send connection is
    /// dropped for recycling and the error surfaced to the caller — which
    /// treats it as a skipped peer, never a publish failure.
    pub async fn send(
        &self,
        switch: &Switch,
        protocols: &[&str],
        bytes: &[u8],
        fp: Option<[u8; 32]>,
        deadline: Duration,
    ) -> Result<bool, SendError> {
        if let Some(fp) = fp {
            if !self.sent_cache.lock().expect("cache lock").insert(fp) {
                return Ok(false);
            }
        }

        let mut slot = self.send_conn.lock().await;
        if slot
            .as_ref()
            .map(|conn| conn.is_closed() || conn.at_eof())
            .unwrap_or(true)
        {
            let info = PeerInfo::remote(self.id.clone(), Vec::new());
            let (channel, protocol) = switch.dial_protocol(&info, protocols).await?;
            tracing::debug!(peer = %self.id.short(), protocol = %protocol, "send channel opened");
            self.set_codec(&protocol);
            *slot = Some(channel);
        }
        let conn = slot.as_ref().expect("send conn just ensured");

        match timeout(deadline, write_lp(conn, bytes)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                let broken = slot.take();
                drop(slot);
                if let Some(conn) = broken {
                    conn.reset().await;
                }
                Err(e.into())
            }
            Err(_) => {
                let broken = slot.take();
                drop(slot);
                if let Some(conn) = broken {
                    conn.reset().await;
                }
                Err(SendError::Timeout)
            }
        }
    }

    /// Drop the send connection (peer left or router shutting down).
    pub async fn shutdown(&self) {
        if let Some(conn) = self.send_conn.lock().await.take() {
            if let Err(e) = conn.close().await {
                tracing::trace!(peer = %self.id.short(), error = %e, "send channel close");
            }
        }
    }
}
