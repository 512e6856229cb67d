//! End-to-end connection pipeline scenarios: dial + echo with balanced
//! trackers, half-close semantics, dial coalescing, and peer-id mismatch.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::stream::{read_lp, write_lp, ByteStream};
use cairn_core::{Keypair, PeerInfo};
use cairn_net::{ProtocolMatcher, SwitchError};
use tokio::sync::mpsc;

use crate::{wait_for, Node};

const ECHO: &str = "/test/proto/1.0.0";

#[tokio::test(flavor = "multi_thread")]
async fn dial_echo_and_balanced_trackers() {
    let a = Node::spawn().await;
    let b = Node::spawn().await;

    a.switch.register(
        ProtocolMatcher::exact(ECHO),
        Arc::new(|channel, _proto, _peer| {
            Box::pin(async move {
                let msg = read_lp(&channel, 1024).await.expect("handler read");
                write_lp(&channel, &msg).await.expect("handler write");
                channel.close().await.expect("handler close");
                // Drain to EOF so the channel closes cleanly on both ends.
                let mut buf = [0u8; 64];
                while matches!(channel.read_once(&mut buf).await, Ok(n) if n > 0) {}
            })
        }),
    );

    let (channel, negotiated) = b
        .switch
        .dial_protocol(&a.peer_info(), &[ECHO])
        .await
        .expect("dial");
    assert_eq!(negotiated, ECHO);

    write_lp(&channel, b"Hello!").await.expect("write");
    let reply = read_lp(&channel, 1024).await.expect("read reply");
    assert_eq!(reply, b"Hello!");

    channel.close().await.expect("close");
    drop(channel);

    // The listener registers the session slightly after the dialer returns.
    wait_for("listener sees the peer", Duration::from_secs(5), || {
        a.switch.connected_peers().len() == 1
    })
    .await;

    b.switch.close().await;
    a.switch.close().await;

    wait_for("b trackers balance", Duration::from_secs(5), || {
        b.tracker.balanced()
    })
    .await;
    wait_for("a trackers balance", Duration::from_secs(5), || {
        a.tracker.balanced()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn half_close_over_the_wire() {
    let a = Node::spawn().await;
    let b = Node::spawn().await;

    // The handler half-closes immediately, then keeps reading.
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    a.switch.register(
        ProtocolMatcher::exact("/half/1.0.0"),
        Arc::new(move |channel, _proto, _peer| {
            let report = report_tx.clone();
            Box::pin(async move {
                channel.close().await.expect("half close");
                let write_fails = channel.write_all(b"nope").await.is_err();

                let late = read_lp(&channel, 1024).await.expect("late read");
                let mut buf = [0u8; 8];
                let eof = channel.read_once(&mut buf).await.expect("eof read") == 0;
                let _ = report.send((write_fails, late, eof));
            })
        }),
    );

    let (channel, _) = b
        .switch
        .dial_protocol(&a.peer_info(), &["/half/1.0.0"])
        .await
        .expect("dial");

    // A closed its direction: we observe EOF but can still write.
    let mut buf = [0u8; 8];
    assert_eq!(channel.read_once(&mut buf).await.expect("read"), 0);
    write_lp(&channel, b"still writable").await.expect("write after remote close");
    channel.close().await.expect("close");

    let (write_fails, late, eof) = report_rx.recv().await.expect("handler report");
    assert!(write_fails, "write after local close must fail");
    assert_eq!(late, b"still writable");
    assert!(eof, "handler reaches EOF after both directions close");

    b.switch.close().await;
    a.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_dials_share_one_session() {
    let a = Node::spawn().await;
    let b = Node::spawn().await;

    let info = a.peer_info();
    let dials = (0..8).map(|_| {
        let switch = b.switch.clone();
        let info = info.clone();
        tokio::spawn(async move { switch.dial(&info).await.map(|s| Arc::as_ptr(&s) as usize) })
    });
    let results = futures::future::join_all(dials).await;

    let mut handles = Vec::new();
    for result in results {
        handles.push(result.expect("join").expect("dial"));
    }
    // Every dial resolved to the same session.
    assert!(handles.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(b.switch.session_count(&info.peer_id), 1);

    b.switch.close().await;
    a.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_id_mismatch_closes_the_connection() {
    let a = Node::spawn().await;
    let b = Node::spawn().await;

    // Dial A's address but expect somebody else's key.
    let imposter = PeerInfo::remote(Keypair::generate().peer_id(), vec![a.addr]);
    let err = b.switch.dial(&imposter).await.unwrap_err();
    match err {
        SwitchError::DialFailed { reason, .. } => {
            assert!(
                reason.contains("expected"),
                "mismatch should name the expectation, got: {reason}"
            );
        }
        other => panic!("expected DialFailed, got {other:?}"),
    }

    wait_for("dialer cleans up", Duration::from_secs(5), || {
        b.tracker.balanced()
    })
    .await;
    wait_for("listener cleans up", Duration::from_secs(5), || {
        a.tracker.balanced()
    })
    .await;

    b.switch.close().await;
    a.switch.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dial_unknown_protocol_fails() {
    let a = Node::spawn().await;
    let b = Node::spawn().await;

    let err = b
        .switch
        .dial_protocol(&a.peer_info(), &["/nobody/1.0.0"])
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchError::Negotiation(_)));

    b.switch.close().await;
    a.switch.close().await;
}
