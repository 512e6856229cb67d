//! Connection and peer lifecycle events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cairn_core::Keypair;
use cairn_net::{ConnectionEvent, PeerEvent};

use crate::{wait_for, Node};

#[tokio::test(flavor = "multi_thread")]
async fn peer_events_fire_once_across_two_connections() {
    let listener = Node::spawn().await;

    let joined = Arc::new(AtomicUsize::new(0));
    let left = Arc::new(AtomicUsize::new(0));
    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));

    {
        let (joined, left) = (joined.clone(), left.clone());
        listener.switch.on_peer_event(Arc::new(move |event| {
            let (joined, left) = (joined.clone(), left.clone());
            Box::pin(async move {
                match event {
                    PeerEvent::Joined(_) => joined.fetch_add(1, Ordering::SeqCst),
                    PeerEvent::Left(_) => left.fetch_add(1, Ordering::SeqCst),
                };
            })
        }));
    }
    {
        let (connected, disconnected) = (connected.clone(), disconnected.clone());
        listener.switch.on_connection_event(Arc::new(move |event| {
            let (connected, disconnected) = (connected.clone(), disconnected.clone());
            Box::pin(async move {
                match event {
                    ConnectionEvent::Connected(_) => connected.fetch_add(1, Ordering::SeqCst),
                    ConnectionEvent::Disconnected(_) => {
                        disconnected.fetch_add(1, Ordering::SeqCst)
                    }
                };
            })
        }));
    }

    // Two physical connections from the same peer identity.
    let shared_identity = Arc::new(Keypair::generate());
    let first = Node::spawn_with_identity(shared_identity.clone()).await;
    let second = Node::spawn_with_identity(shared_identity).await;

    first
        .switch
        .dial(&listener.peer_info())
        .await
        .expect("first dial");
    second
        .switch
        .dial(&listener.peer_info())
        .await
        .expect("second dial");

    wait_for("both connections land", Duration::from_secs(5), || {
        connected.load(Ordering::SeqCst) == 2
    })
    .await;
    assert_eq!(joined.load(Ordering::SeqCst), 1, "one Joined for one peer");
    assert_eq!(listener.switch.connected_peers().len(), 1);

    first.switch.close().await;
    wait_for("first disconnect lands", Duration::from_secs(5), || {
        disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(left.load(Ordering::SeqCst), 0, "peer still has a connection");

    second.switch.close().await;
    wait_for("second disconnect lands", Duration::from_secs(5), || {
        disconnected.load(Ordering::SeqCst) == 2
    })
    .await;
    wait_for("Left fires", Duration::from_secs(5), || {
        left.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(joined.load(Ordering::SeqCst), 1, "Joined never refires");

    listener.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_from_inside_a_hook_is_tolerated() {
    let listener = Node::spawn().await;

    // A hostile hook that disconnects every peer as soon as it joins.
    {
        let switch = listener.switch.clone();
        listener.switch.on_peer_event(Arc::new(move |event| {
            let switch = switch.clone();
            Box::pin(async move {
                if let PeerEvent::Joined(peer) = event {
                    switch.disconnect(&peer).await;
                }
            })
        }));
    }

    let dialer = Node::spawn().await;
    // The dial may succeed and then be torn down, or fail mid-upgrade;
    // either way nothing may deadlock or leak.
    let _ = dialer.switch.dial(&listener.peer_info()).await;

    wait_for("listener table empties", Duration::from_secs(5), || {
        listener.switch.connected_peers().is_empty()
    })
    .await;

    dialer.switch.close().await;
    listener.switch.close().await;
    wait_for("listener trackers balance", Duration::from_secs(5), || {
        listener.tracker.balanced()
    })
    .await;
}
