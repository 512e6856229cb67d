//! Cairn integration test harness.
//!
//! Every test spins up in-process nodes talking real TCP over loopback:
//! full upgrade pipeline (multistream → Noise → multistream → mplex), real
//! switches, real routers. Each node carries a counting resource tracker so
//! tests can assert that connections, secure channels, and mux channels all
//! balance to zero after shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::tracker::CountingTracker;
use cairn_core::{Keypair, PeerInfo};
use cairn_net::{Switch, SwitchConfig, TcpTransport};

mod events;
mod pipeline;
mod pubsub;

pub struct Node {
    pub identity: Arc<Keypair>,
    pub switch: Arc<Switch>,
    pub tracker: Arc<CountingTracker>,
    pub addr: SocketAddr,
}

impl Node {
    /// A listening node with a fresh identity.
    pub async fn spawn() -> Node {
        Self::spawn_with_identity(Arc::new(Keypair::generate())).await
    }

    /// A listening node reusing `identity` (for same-peer multi-switch
    /// scenarios).
    pub async fn spawn_with_identity(identity: Arc<Keypair>) -> Node {
        let tracker = CountingTracker::new();
        let switch = Arc::new(Switch::new(
            identity.clone(),
            Arc::new(TcpTransport),
            SwitchConfig::default(),
            tracker.clone(),
        ));
        let addr = switch
            .listen("127.0.0.1:0".parse().expect("loopback addr"))
            .await
            .expect("listen");
        Node {
            identity,
            switch,
            tracker,
            addr,
        }
    }

    /// How another node reaches this one.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::remote(self.identity.peer_id(), vec![self.addr])
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let result = tokio::time::timeout(deadline, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}
