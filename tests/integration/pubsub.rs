//! FloodSub and GossipSub scenarios over real TCP nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cairn_core::stream::write_lp;
use cairn_core::ByteStream;
use cairn_pubsub::rpc::{Message, Rpc};
use cairn_pubsub::{FloodSub, GossipSub, GossipsubConfig, PubSubConfig, RouterCore, FLOODSUB_ID};
use prost::Message as _;

use crate::{wait_for, Node};

struct PubsubNode {
    node: Node,
    router: Arc<RouterCore>,
}

async fn floodsub_node() -> PubsubNode {
    let node = Node::spawn().await;
    let router = FloodSub::new(
        node.switch.clone(),
        node.identity.clone(),
        PubSubConfig::default(),
    )
    .core()
    .clone();
    PubsubNode { node, router }
}

/// Subscribe with a counting handler; returns (count, last payload).
async fn counting_subscription(
    router: &Arc<RouterCore>,
    topic: &str,
) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<u8>>>) {
    let count = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(Vec::new()));
    let (count2, last2) = (count.clone(), last.clone());
    router
        .subscribe(
            topic,
            Arc::new(move |msg| {
                let count = count2.clone();
                let last = last2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    *last.lock().unwrap() = msg.data.unwrap_or_default();
                })
            }),
        )
        .await;
    (count, last)
}

#[tokio::test(flavor = "multi_thread")]
async fn floodsub_publish_reaches_subscriber() {
    let a = floodsub_node().await;
    let b = floodsub_node().await;

    let (delivered, payload) = counting_subscription(&b.router, "foobar").await;

    // Connect after subscribing: the join hook announces B's topics to A.
    b.node.switch.dial(&a.node.peer_info()).await.expect("dial");
    wait_for("subscription propagates", Duration::from_secs(5), || {
        !a.router.topic_peers("foobar").is_empty()
    })
    .await;

    let sent = a.router.publish("foobar", b"Hello!").await;
    assert_eq!(sent, 1);

    wait_for("delivery", Duration::from_secs(5), || {
        delivered.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(*payload.lock().unwrap(), b"Hello!");

    // No spurious second delivery.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    a.router.close().await;
    b.router.close().await;
    a.node.switch.close().await;
    b.node.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_rpc_bytes_deliver_once() {
    let a = floodsub_node().await;
    let b = floodsub_node().await;

    let (delivered, _) = counting_subscription(&b.router, "dedup-topic").await;
    b.node.switch.dial(&a.node.peer_info()).await.expect("dial");
    wait_for("subscription propagates", Duration::from_secs(5), || {
        !a.router.topic_peers("dedup-topic").is_empty()
    })
    .await;

    // Hand-craft one RPC and push the identical bytes twice over a raw
    // floodsub stream — the receive caches must suppress the duplicate.
    let rpc = Rpc {
        publish: vec![Message {
            from: Some(a.router.local_peer().as_bytes().to_vec()),
            data: Some(b"Hello!".to_vec()),
            seqno: Some(42u64.to_be_bytes().to_vec()),
            topic_ids: vec!["dedup-topic".to_string()],
            signature: None,
            key: None,
        }],
        ..Default::default()
    };
    let bytes = rpc.encode_to_vec();

    let (channel, _) = a
        .node
        .switch
        .dial_protocol(&b.node.peer_info(), &[FLOODSUB_ID])
        .await
        .expect("raw pubsub stream");
    write_lp(&channel, &bytes).await.expect("first send");
    write_lp(&channel, &bytes).await.expect("second send");

    wait_for("single delivery", Duration::from_secs(5), || {
        delivered.load(Ordering::SeqCst) >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        delivered.load(Ordering::SeqCst),
        1,
        "identical bytes must be deduplicated"
    );

    channel.close().await.ok();
    a.router.close().await;
    b.router.close().await;
    a.node.switch.close().await;
    b.node.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_counts_only_subscribed_peers() {
    let a = floodsub_node().await;
    let b = floodsub_node().await;

    b.node.switch.dial(&a.node.peer_info()).await.expect("dial");
    wait_for("peers see each other", Duration::from_secs(5), || {
        a.router.peer_count() == 1
    })
    .await;

    // Nobody subscribed anywhere yet.
    assert_eq!(a.router.publish("quiet", b"x").await, 0);

    let (_count, _) = counting_subscription(&b.router, "loud").await;
    wait_for("subscription propagates", Duration::from_secs(5), || {
        !a.router.topic_peers("loud").is_empty()
    })
    .await;
    assert_eq!(a.router.publish("loud", b"y").await, 1);

    a.router.close().await;
    b.router.close().await;
    a.node.switch.close().await;
    b.node.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_self_delivers_locally() {
    let a = floodsub_node().await;
    let (delivered, payload) = counting_subscription(&a.router, "selfie").await;

    let sent = a.router.publish("selfie", b"to me").await;
    assert_eq!(sent, 0, "no remote peers");
    assert_eq!(delivered.load(Ordering::SeqCst), 1, "delivered synchronously");
    assert_eq!(*payload.lock().unwrap(), b"to me");

    a.router.close().await;
    a.node.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_validator_drops_message() {
    let a = floodsub_node().await;
    let b = floodsub_node().await;

    let (delivered, _) = counting_subscription(&b.router, "guarded").await;
    b.router.add_validator(
        "guarded",
        Arc::new(|msg| {
            Box::pin(async move {
                msg.data.as_deref() == Some(b"good".as_slice())
            })
        }),
    );

    b.node.switch.dial(&a.node.peer_info()).await.expect("dial");
    wait_for("subscription propagates", Duration::from_secs(5), || {
        !a.router.topic_peers("guarded").is_empty()
    })
    .await;

    a.router.publish("guarded", b"evil").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0, "validator must drop");

    a.router.publish("guarded", b"good").await;
    wait_for("valid message delivered", Duration::from_secs(5), || {
        delivered.load(Ordering::SeqCst) == 1
    })
    .await;

    a.router.close().await;
    b.router.close().await;
    a.node.switch.close().await;
    b.node.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_stops_delivery() {
    let a = floodsub_node().await;
    let b = floodsub_node().await;

    let (delivered, _) = counting_subscription(&b.router, "ephemeral").await;
    b.node.switch.dial(&a.node.peer_info()).await.expect("dial");
    wait_for("subscription propagates", Duration::from_secs(5), || {
        !a.router.topic_peers("ephemeral").is_empty()
    })
    .await;

    b.router.unsubscribe("ephemeral").await;
    wait_for("unsubscribe propagates", Duration::from_secs(5), || {
        a.router.topic_peers("ephemeral").is_empty()
    })
    .await;

    assert_eq!(a.router.publish("ephemeral", b"late").await, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);

    a.router.close().await;
    b.router.close().await;
    a.node.switch.close().await;
    b.node.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn gossipsub_forms_mesh_and_delivers() {
    let gossip_config = GossipsubConfig {
        heartbeat_interval: Duration::from_millis(150),
        ..GossipsubConfig::default()
    };

    let node_a = Node::spawn().await;
    let node_b = Node::spawn().await;
    let a = GossipSub::new(
        node_a.switch.clone(),
        node_a.identity.clone(),
        PubSubConfig::default(),
        gossip_config.clone(),
    );
    let b = GossipSub::new(
        node_b.switch.clone(),
        node_b.identity.clone(),
        PubSubConfig::default(),
        gossip_config,
    );

    let (delivered, payload) = counting_subscription(b.core(), "mesh-topic").await;
    a.core()
        .subscribe("mesh-topic", Arc::new(|_| Box::pin(async {})))
        .await;

    node_b.switch.dial(&node_a.peer_info()).await.expect("dial");

    wait_for("mesh forms", Duration::from_secs(5), || {
        !a.mesh_peers("mesh-topic").is_empty()
    })
    .await;

    let sent = a.core().publish("mesh-topic", b"over the mesh").await;
    assert!(sent >= 1);

    wait_for("mesh delivery", Duration::from_secs(5), || {
        delivered.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(*payload.lock().unwrap(), b"over the mesh");

    a.core().close().await;
    b.core().close().await;
    node_a.switch.close().await;
    node_b.switch.close().await;
}
