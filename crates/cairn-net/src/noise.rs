//! Noise XX secure channel.
//!
//! Mutually authenticates two peers and provides the encrypted record layer
//! every higher layer rides on. snow drives the
//! `Noise_XX_25519_ChaChaPoly_SHA256` state machine; the static DH keypair
//! is generated per connection via x25519-dalek so its public half can be
//! signed by the long-term identity key.
//!
//! Handshake messages and records share one wire shape: a 2-byte big-endian
//! length prefix followed by the Noise message. Message 2 and message 3
//! carry a protobuf identity payload {public_key, signature} where the
//! signature covers `"noise-libp2p-static-key:" || static_public_key` and
//! must verify under the carried identity key.

use async_trait::async_trait;
use bytes::BytesMut;
use prost::Message;
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use cairn_core::identity::IdentityError;
use cairn_core::stream::{read_exact, ByteStream, StreamError};
use cairn_core::{Keypair, PeerId, PublicKey};

/// Multistream identifier for the Noise security upgrade.
pub const PROTOCOL_ID: &str = "/noise";

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Domain-separation prefix for static key signatures.
const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";

/// Largest plaintext chunk per record. One record = 2-byte length +
/// ciphertext + 16-byte tag, and the ciphertext length must fit in 16 bits.
pub const MAX_PLAINTEXT: usize = 65519;

/// Largest Noise message on the wire (ciphertext including tag).
const MAX_RECORD: usize = 65535;

/// Hard deadline for the complete 3-message handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity payload exchanged inside handshake messages 2 and 3.
#[derive(Clone, PartialEq, Message)]
struct HandshakePayload {
    #[prost(bytes = "vec", tag = "1")]
    identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    identity_sig: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("noise protocol: {0}")]
    Snow(#[from] snow::Error),

    #[error("handshake payload: {0}")]
    Payload(#[from] prost::DecodeError),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("remote presented peer {actual}, expected {expected}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    #[error("handshake missing remote static key")]
    MissingStaticKey,

    #[error("handshake deadline exceeded")]
    Timeout,

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Authentication tag mismatch on a record.
    #[error("record decryption failed")]
    Decrypt,

    /// Per-direction nonce counter reached its ceiling. Fatal.
    #[error("nonce exhausted on secure channel")]
    NonceExhausted,
}

// ── Handshake framing ─────────────────────────────────────────────────────────

async fn write_frame<S: ByteStream + ?Sized>(io: &S, msg: &[u8]) -> Result<(), StreamError> {
    debug_assert!(msg.len() <= MAX_RECORD);
    let mut framed = Vec::with_capacity(2 + msg.len());
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    io.write_all(&framed).await
}

async fn read_frame<S: ByteStream + ?Sized>(io: &S) -> Result<Vec<u8>, StreamError> {
    let mut len_bytes = [0u8; 2];
    read_exact(io, &mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    let mut msg = vec![0u8; len];
    read_exact(io, &mut msg).await?;
    Ok(msg)
}

// ── Handshake ─────────────────────────────────────────────────────────────────

fn builder(local_static: &Zeroizing<[u8; 32]>) -> Result<Builder<'_>, NoiseError> {
    let params: snow::params::NoiseParams = NOISE_PARAMS.parse()?;
    Ok(Builder::new(params).local_private_key(local_static.as_ref()))
}

fn identity_payload(identity: &Keypair, static_public: &X25519Public) -> Vec<u8> {
    let mut msg = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + 32);
    msg.extend_from_slice(STATIC_KEY_DOMAIN);
    msg.extend_from_slice(static_public.as_bytes());
    HandshakePayload {
        identity_key: identity.public().encode_protobuf(),
        identity_sig: identity.sign(&msg),
    }
    .encode_to_vec()
}

/// Verify the identity payload against the remote's Noise static key and
/// return the authenticated identity.
fn verify_payload(
    payload: &[u8],
    state: &HandshakeState,
) -> Result<(PeerId, PublicKey), NoiseError> {
    let remote_static = state.get_remote_static().ok_or(NoiseError::MissingStaticKey)?;
    let payload = HandshakePayload::decode(payload)?;
    let identity_key = PublicKey::decode_protobuf(&payload.identity_key)?;

    let mut msg = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + remote_static.len());
    msg.extend_from_slice(STATIC_KEY_DOMAIN);
    msg.extend_from_slice(remote_static);
    identity_key.verify(&msg, &payload.identity_sig)?;

    Ok((identity_key.to_peer_id(), identity_key))
}

/// Run the handshake as the initiator.
///
/// If `expected` is set (we dialed a known peer), the authenticated remote
/// PeerId must match it.
pub async fn secure_outbound(
    io: Box<dyn ByteStream>,
    identity: &Keypair,
    expected: Option<&PeerId>,
    deadline: Duration,
) -> Result<SecureStream, NoiseError> {
    tokio::time::timeout(deadline, async {
        let static_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let static_public = X25519Public::from(&static_secret);
        let static_bytes = Zeroizing::new(static_secret.to_bytes());
        let mut state = builder(&static_bytes)?.build_initiator()?;

        // -> e
        let mut buf = vec![0u8; MAX_RECORD];
        let len = state.write_message(&[], &mut buf)?;
        write_frame(io.as_ref(), &buf[..len]).await?;

        // <- e, ee, s, es  + identity payload
        let msg2 = read_frame(io.as_ref()).await?;
        let mut payload = vec![0u8; msg2.len()];
        let n = state.read_message(&msg2, &mut payload)?;
        let (remote_peer, remote_key) = verify_payload(&payload[..n], &state)?;

        if let Some(expected) = expected {
            if *expected != remote_peer {
                return Err(NoiseError::PeerIdMismatch {
                    expected: expected.clone(),
                    actual: remote_peer,
                });
            }
        }

        // -> s, se  + identity payload
        let our_payload = identity_payload(identity, &static_public);
        let len = state.write_message(&our_payload, &mut buf)?;
        write_frame(io.as_ref(), &buf[..len]).await?;

        let transport = state.into_transport_mode()?;
        tracing::debug!(peer = %remote_peer.short(), "noise handshake complete (initiator)");
        Ok(SecureStream::new(io, transport, remote_peer, remote_key))
    })
    .await
    .map_err(|_| NoiseError::Timeout)?
}

/// Run the handshake as the responder.
pub async fn secure_inbound(
    io: Box<dyn ByteStream>,
    identity: &Keypair,
    deadline: Duration,
) -> Result<SecureStream, NoiseError> {
    tokio::time::timeout(deadline, async {
        let static_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let static_public = X25519Public::from(&static_secret);
        let static_bytes = Zeroizing::new(static_secret.to_bytes());
        let mut state = builder(&static_bytes)?.build_responder()?;

        // <- e
        let msg1 = read_frame(io.as_ref()).await?;
        let mut payload = vec![0u8; msg1.len().max(1)];
        state.read_message(&msg1, &mut payload)?;

        // -> e, ee, s, es  + identity payload
        let our_payload = identity_payload(identity, &static_public);
        let mut buf = vec![0u8; MAX_RECORD];
        let len = state.write_message(&our_payload, &mut buf)?;
        write_frame(io.as_ref(), &buf[..len]).await?;

        // <- s, se  + identity payload
        let msg3 = read_frame(io.as_ref()).await?;
        let mut payload = vec![0u8; msg3.len()];
        let n = state.read_message(&msg3, &mut payload)?;
        let (remote_peer, remote_key) = verify_payload(&payload[..n], &state)?;

        let transport = state.into_transport_mode()?;
        tracing::debug!(peer = %remote_peer.short(), "noise handshake complete (responder)");
        Ok(SecureStream::new(io, transport, remote_peer, remote_key))
    })
    .await
    .map_err(|_| NoiseError::Timeout)?
}

// ── Record layer ──────────────────────────────────────────────────────────────

struct ReadState {
    /// Decrypted bytes not yet handed to a reader.
    leftover: BytesMut,
}

/// A connection whose reads and writes pass through the Noise cipher pair.
///
/// Writes larger than [`MAX_PLAINTEXT`] are split across records. Reads
/// silently skip zero-length plaintexts. Nonces advance implicitly inside
/// snow's transport state; exhaustion surfaces as a fatal write/read error.
pub struct SecureStream {
    inner: Box<dyn ByteStream>,
    cipher: Mutex<TransportState>,
    read_state: Mutex<ReadState>,
    write_lock: Mutex<()>,
    remote_peer: PeerId,
    remote_key: PublicKey,
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("remote_peer", &self.remote_peer)
            .field("remote_key", &self.remote_key)
            .finish()
    }
}

impl SecureStream {
    fn new(
        inner: Box<dyn ByteStream>,
        cipher: TransportState,
        remote_peer: PeerId,
        remote_key: PublicKey,
    ) -> Self {
        Self {
            inner,
            cipher: Mutex::new(cipher),
            read_state: Mutex::new(ReadState {
                leftover: BytesMut::new(),
            }),
            write_lock: Mutex::new(()),
            remote_peer,
            remote_key,
        }
    }

    /// The authenticated remote peer.
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_key
    }

    fn crypto_err(e: NoiseError) -> StreamError {
        StreamError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn map_cipher(e: snow::Error) -> NoiseError {
        match e {
            snow::Error::State(snow::error::StateProblem::Exhausted) => NoiseError::NonceExhausted,
            snow::Error::Decrypt => NoiseError::Decrypt,
            other => NoiseError::Snow(other),
        }
    }

    /// Read and decrypt one record. Ok(None) = clean EOF at a record boundary.
    async fn read_record(&self) -> Result<Option<Vec<u8>>, StreamError> {
        // First length byte by hand: EOF here is a clean end of stream,
        // EOF anywhere later in the record is an incomplete read.
        let mut first = [0u8; 1];
        let n = self.inner.read_once(&mut first).await?;
        if n == 0 {
            return Ok(None);
        }
        let mut second = [0u8; 1];
        read_exact(self.inner.as_ref(), &mut second).await?;
        let len = u16::from_be_bytes([first[0], second[0]]) as usize;

        let mut ciphertext = vec![0u8; len];
        read_exact(self.inner.as_ref(), &mut ciphertext).await?;

        let mut plaintext = vec![0u8; len];
        let n = {
            let mut cipher = self.cipher.lock().await;
            cipher
                .read_message(&ciphertext, &mut plaintext)
                .map_err(|e| Self::crypto_err(Self::map_cipher(e)))?
        };
        plaintext.truncate(n);
        Ok(Some(plaintext))
    }

    /// Encrypt and frame one record. Caller holds the write guard.
    async fn write_record(&self, chunk: &[u8]) -> Result<(), StreamError> {
        let mut ciphertext = vec![0u8; chunk.len() + 16];
        let n = {
            let mut cipher = self.cipher.lock().await;
            cipher
                .write_message(chunk, &mut ciphertext)
                .map_err(|e| Self::crypto_err(Self::map_cipher(e)))?
        };
        ciphertext.truncate(n);
        let mut framed = Vec::with_capacity(2 + ciphertext.len());
        framed.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        framed.extend_from_slice(&ciphertext);
        self.inner.write_all(&framed).await
    }
}

#[async_trait]
impl ByteStream for SecureStream {
    async fn read_once(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut state = self.read_state.lock().await;
        while state.leftover.is_empty() {
            match self.read_record().await? {
                // Zero-length plaintexts are skipped.
                Some(plaintext) if plaintext.is_empty() => continue,
                Some(plaintext) => state.leftover.extend_from_slice(&plaintext),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(state.leftover.len());
        buf[..n].copy_from_slice(&state.leftover.split_to(n));
        Ok(n)
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), StreamError> {
        // Chunks must hit the wire in encryption order — the guard spans the
        // whole message, the cipher lock only each encrypt.
        let _guard = self.write_lock.lock().await;
        if data.is_empty() {
            return self.write_record(&[]).await;
        }
        for chunk in data.chunks(MAX_PLAINTEXT) {
            self.write_record(chunk).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn at_eof(&self) -> bool {
        self.inner.at_eof()
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.remote_addr()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
