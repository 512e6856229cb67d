//! Mplex stream multiplexer.
//!
//! Carries many independent, flow-controlled byte streams over one secured
//! connection. See [`frame`] for the wire format, [`Channel`] for per-stream
//! semantics, and [`Session`] for the demultiplexing read loop.

pub mod frame;

mod channel;
mod session;

pub use channel::Channel;
pub use frame::{Frame, FrameError, Tag, MAX_MSG_SIZE};
pub use session::{Session, SessionConfig, StreamHandler};

use thiserror::Error;

use cairn_core::stream::StreamError;

/// Multistream identifier for the mplex muxer.
pub const PROTOCOL_ID: &str = "/mplex/6.7.0";

/// Session-level errors. Any of these is fatal for the whole session;
/// per-channel failures surface as [`StreamError`] on the channel instead.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("remote reused open channel id {0}")]
    DuplicateChannel(u64),

    /// A frame's direction bit contradicts who actually opened the channel.
    #[error("direction violation on channel {id}")]
    DirectionViolation { id: u64 },

    #[error("session closed")]
    SessionClosed,

    #[error(transparent)]
    Stream(#[from] StreamError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use cairn_core::stream::{ByteStream, SocketStream, StreamError};
    use cairn_core::tracker::{self, CountingTracker, Resource};

    /// A connected pair of sessions over an in-memory pipe. Channels the
    /// right session receives are forwarded through the returned receiver.
    fn session_pair(
        config: SessionConfig,
        tracker: tracker::SharedTracker,
    ) -> (Session, Session, mpsc::UnboundedReceiver<Channel>) {
        let (a, b) = tokio::io::duplex(1 << 18);
        let left = Session::new(
            Box::new(SocketStream::new(a, None)),
            config.clone(),
            Box::new(|ch| drop(ch)),
            tracker.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let right = Session::new(
            Box::new(SocketStream::new(b, None)),
            config,
            Box::new(move |ch| {
                let _ = tx.send(ch);
            }),
            tracker,
        );
        (left, right, rx)
    }

    #[tokio::test]
    async fn open_write_read_across_sessions() {
        let (left, _right, mut incoming) = session_pair(SessionConfig::default(), tracker::noop());

        let ch = left.open_channel("echo").await.unwrap();
        ch.write_all(b"Hello!").await.unwrap();

        let remote = incoming.recv().await.unwrap();
        assert_eq!(remote.name(), "echo");
        assert!(!remote.is_initiator());

        let mut buf = [0u8; 16];
        let n = remote.read_once(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello!");
    }

    #[tokio::test]
    async fn channel_ids_strictly_increase() {
        let (left, _right, _incoming) = session_pair(SessionConfig::default(), tracker::noop());
        let mut last = None;
        for _ in 0..5 {
            let ch = left.open_channel("seq").await.unwrap();
            if let Some(prev) = last {
                assert!(ch.id() > prev);
            }
            last = Some(ch.id());
        }
    }

    #[tokio::test]
    async fn half_close_keeps_reading() {
        let (left, _right, mut incoming) = session_pair(SessionConfig::default(), tracker::noop());

        let local = left.open_channel("half").await.unwrap();
        let remote = incoming.recv().await.unwrap();

        local.close().await.unwrap();
        assert!(matches!(
            local.write_all(b"nope").await.unwrap_err(),
            StreamError::WriteClosed
        ));

        // The other side can still write; we can still read.
        remote.write_all(b"still open").await.unwrap();
        let mut buf = [0u8; 16];
        let n = local.read_once(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still open");

        // Remote observes our close as EOF after draining.
        let mut buf = [0u8; 4];
        assert_eq!(remote.read_once(&mut buf).await.unwrap(), 0);

        // Once the remote also closes, we reach EOF.
        remote.close().await.unwrap();
        assert_eq!(local.read_once(&mut buf).await.unwrap(), 0);
        assert!(local.at_eof());
    }

    #[tokio::test]
    async fn close_right_after_open_still_delivers_writes() {
        let (left, _right, mut incoming) = session_pair(SessionConfig::default(), tracker::noop());

        let local = left.open_channel("burst").await.unwrap();
        local.write_all(b"payload").await.unwrap();
        local.close().await.unwrap();

        let remote = incoming.recv().await.unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = remote.read_once(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"payload");
    }

    #[tokio::test]
    async fn reset_wakes_pending_reader() {
        let (left, _right, mut incoming) = session_pair(SessionConfig::default(), tracker::noop());

        let local = Arc::new(left.open_channel("reset").await.unwrap());
        let _remote = incoming.recv().await.unwrap();

        let reader = {
            let local = local.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                local.read_once(&mut buf).await
            })
        };
        // Give the reader time to block on the empty buffer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        local.reset().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("pending read must not hang")
            .unwrap();
        assert!(matches!(result.unwrap_err(), StreamError::Reset));
    }

    #[tokio::test]
    async fn remote_reset_discards_buffered_data() {
        let (left, _right, mut incoming) = session_pair(SessionConfig::default(), tracker::noop());

        let local = left.open_channel("discard").await.unwrap();
        let remote = incoming.recv().await.unwrap();

        local.write_all(b"doomed").await.unwrap();
        // Let the data land in the remote buffer before the reset follows.
        tokio::time::sleep(Duration::from_millis(20)).await;
        local.reset().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 8];
        assert!(matches!(
            remote.read_once(&mut buf).await.unwrap_err(),
            StreamError::Reset
        ));
    }

    #[tokio::test]
    async fn session_close_resets_all_channels() {
        let tracker = CountingTracker::new();
        let shared: tracker::SharedTracker = tracker.clone();
        let (left, right, mut incoming) = session_pair(SessionConfig::default(), shared);

        let a = left.open_channel("one").await.unwrap();
        let _b = left.open_channel("two").await.unwrap();
        let ra = incoming.recv().await.unwrap();
        let _rb = incoming.recv().await.unwrap();

        left.close().await;

        let mut buf = [0u8; 4];
        assert!(matches!(
            a.read_once(&mut buf).await.unwrap_err(),
            StreamError::Reset
        ));
        assert!(a.at_eof());

        // The right session sees the dead connection and resets its side.
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ra.read_once(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(deadline.is_ok(), "remote channels must unblock on session close");

        right.close().await;
        drop((a, _b, ra, _rb));
        drop((left, right));
        assert_eq!(tracker.live(Resource::MuxChannel), 0);
        assert_eq!(tracker.live(Resource::MuxSession), 0);
    }

    #[tokio::test]
    async fn idle_channel_resets_itself() {
        let config = SessionConfig {
            idle_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let (left, _right, mut incoming) = session_pair(config, tracker::noop());

        let local = left.open_channel("idle").await.unwrap();
        let _remote = incoming.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;

        let mut buf = [0u8; 4];
        assert!(matches!(
            local.read_once(&mut buf).await.unwrap_err(),
            StreamError::Reset
        ));
    }

    #[tokio::test]
    async fn large_write_is_split_into_frames() {
        let (left, _right, mut incoming) = session_pair(SessionConfig::default(), tracker::noop());

        let local = left.open_channel("big").await.unwrap();
        let remote = incoming.recv().await.unwrap();

        let data = vec![0x42u8; MAX_MSG_SIZE + 1024];
        let expected = data.len();
        let writer = tokio::spawn(async move {
            local.write_all(&data).await.unwrap();
            local
        });

        let mut got = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while got < expected {
            let n = remote.read_once(&mut buf).await.unwrap();
            assert!(n > 0);
            got += n;
        }
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn direction_violation_is_fatal() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let raw = SocketStream::new(a, None);
        let (hold_tx, mut hold_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            Box::new(SocketStream::new(b, None)),
            SessionConfig::default(),
            Box::new(move |ch| {
                let _ = hold_tx.send(ch);
            }),
            tracker::noop(),
        );

        // Channel 0 opened by the raw side; a MsgReceiver frame for it then
        // claims *we* opened it. The session must tear down.
        let open = Frame::new(0, Tag::NewStream, Bytes::from_static(b"evil"));
        raw.write_all(&open.encode().unwrap()).await.unwrap();
        let _held = hold_rx.recv().await.unwrap();

        let lie = Frame::new(0, Tag::MsgReceiver, Bytes::from_static(b"x"));
        raw.write_all(&lie.encode().unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session must close on direction violation");
    }

    #[tokio::test]
    async fn late_frames_for_forgotten_channels_are_dropped() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let raw = SocketStream::new(a, None);
        let session = Session::new(
            Box::new(SocketStream::new(b, None)),
            SessionConfig::default(),
            Box::new(|ch| drop(ch)),
            tracker::noop(),
        );

        // Data for a channel that never existed: silently ignored.
        let stray = Frame::new(99, Tag::MsgInitiator, Bytes::from_static(b"late"));
        raw.write_all(&stray.encode().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_closed());
        session.close().await;
    }
}
