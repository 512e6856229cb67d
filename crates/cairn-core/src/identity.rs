//! Peer identity — Ed25519 keypairs, public-key envelopes, and PeerIds.
//!
//! A peer's identity key signs its Noise static key during the handshake
//! and (optionally) its pubsub messages. The PeerId is a multihash over the
//! protobuf-encoded public key: short keys embed verbatim (identity
//! multihash), anything longer is hashed with SHA-256.
//!
//! Private key bytes are wrapped in Zeroizing and wiped on drop.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use prost::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Protobuf envelope for transported public keys.
///
/// Field numbers are wire protocol; only Ed25519 (key_type = 1) is produced,
/// anything else is rejected on decode.
#[derive(Clone, PartialEq, Message)]
pub struct PublicKeyProto {
    #[prost(int32, tag = "1")]
    pub key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

const KEY_TYPE_ED25519: i32 = 1;

/// Multihash codes used for PeerId derivation.
const MULTIHASH_IDENTITY: u8 = 0x00;
const MULTIHASH_SHA2_256: u8 = 0x12;

/// Keys whose encoded envelope fits this bound are embedded verbatim in the
/// PeerId; larger ones are hashed.
const MAX_INLINE_KEY_LEN: usize = 42;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed public key envelope: {0}")]
    Envelope(#[from] prost::DecodeError),

    #[error("unsupported key type {0}")]
    UnsupportedKeyType(i32),

    #[error("invalid Ed25519 key material")]
    BadKey,

    #[error("signature verification failed")]
    BadSignature,

    #[error("keypair file: {0}")]
    Io(#[from] std::io::Error),
}

// ── Public key ────────────────────────────────────────────────────────────────

/// An Ed25519 public identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Encode into the protobuf envelope carried on the wire.
    pub fn encode_protobuf(&self) -> Vec<u8> {
        PublicKeyProto {
            key_type: KEY_TYPE_ED25519,
            data: self.0.to_bytes().to_vec(),
        }
        .encode_to_vec()
    }

    /// Decode a wire envelope back into a key.
    pub fn decode_protobuf(bytes: &[u8]) -> Result<Self, IdentityError> {
        let proto = PublicKeyProto::decode(bytes)?;
        if proto.key_type != KEY_TYPE_ED25519 {
            return Err(IdentityError::UnsupportedKeyType(proto.key_type));
        }
        let raw: [u8; 32] = proto.data.as_slice().try_into().map_err(|_| IdentityError::BadKey)?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|_| IdentityError::BadKey)?;
        Ok(Self(key))
    }

    /// Verify `signature` over `msg` under this key.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let sig = Signature::from_slice(signature).map_err(|_| IdentityError::BadSignature)?;
        self.0
            .verify(msg, &sig)
            .map_err(|_| IdentityError::BadSignature)
    }

    /// Derive the PeerId for this key.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }

    pub fn raw_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A long-term Ed25519 identity keypair.
///
/// Generated once per node and stored persistently. The private half never
/// leaves this struct except through `private_bytes` for storage.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Self { signing }
    }

    /// Reconstruct from stored private key bytes.
    pub fn from_private(private: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&private),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Sign `msg` with the identity key.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }

    /// Load the keypair at `path`, generating and persisting a fresh one
    /// (mode 0600) if the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| IdentityError::BadKey)?;
                Ok(Self::from_private(raw))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let kp = Self::generate();
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, kp.private_bytes().as_slice())?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }
                Ok(kp)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ── PeerId ────────────────────────────────────────────────────────────────────

/// A stable peer identifier — multihash of the protobuf-encoded public key.
///
/// Equality and hashing are by byte representation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let encoded = key.encode_protobuf();
        let mut bytes = Vec::with_capacity(2 + encoded.len().min(32));
        if encoded.len() <= MAX_INLINE_KEY_LEN {
            bytes.push(MULTIHASH_IDENTITY);
            bytes.push(encoded.len() as u8);
            bytes.extend_from_slice(&encoded);
        } else {
            bytes.push(MULTIHASH_SHA2_256);
            bytes.push(32);
            bytes.extend_from_slice(&Sha256::digest(&encoded));
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(6)])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

// ── PeerInfo ──────────────────────────────────────────────────────────────────

/// Everything known about a peer: identity, where to reach it, and which
/// protocols it speaks. Only the local peer carries a private key.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub public_key: Option<PublicKey>,
    pub addrs: Vec<std::net::SocketAddr>,
    pub protocols: Vec<String>,
    pub keypair: Option<std::sync::Arc<Keypair>>,
}

impl PeerInfo {
    /// Info for the local peer, holding the private key.
    pub fn local(keypair: std::sync::Arc<Keypair>) -> Self {
        Self {
            peer_id: keypair.peer_id(),
            public_key: Some(keypair.public()),
            addrs: Vec::new(),
            protocols: Vec::new(),
            keypair: Some(keypair),
        }
    }

    /// Info for a remote peer known only by id and addresses.
    pub fn remote(peer_id: PeerId, addrs: Vec<std::net::SocketAddr>) -> Self {
        Self {
            peer_id,
            public_key: None,
            addrs,
            protocols: Vec::new(),
            keypair: None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_roundtrip_via_private_bytes() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::from_private(*kp1.private_bytes());
        assert_eq!(kp1.public(), kp2.public());
        assert_eq!(kp1.peer_id(), kp2.peer_id());
    }

    #[test]
    fn two_keypairs_are_different() {
        assert_ne!(Keypair::generate().peer_id(), Keypair::generate().peer_id());
    }

    #[test]
    fn public_key_envelope_roundtrip() {
        let kp = Keypair::generate();
        let encoded = kp.public().encode_protobuf();
        let decoded = PublicKey::decode_protobuf(&encoded).unwrap();
        assert_eq!(decoded, kp.public());
    }

    #[test]
    fn envelope_rejects_unknown_key_type() {
        let proto = PublicKeyProto {
            key_type: 99,
            data: vec![0u8; 32],
        };
        let err = PublicKey::decode_protobuf(&proto.encode_to_vec()).unwrap_err();
        assert!(matches!(err, IdentityError::UnsupportedKeyType(99)));
    }

    #[test]
    fn ed25519_peer_ids_use_identity_multihash() {
        let kp = Keypair::generate();
        let id = kp.peer_id();
        // Envelope is 36 bytes (2 varint headers + 2 field bytes + 32 key bytes),
        // well under the inline bound.
        assert_eq!(id.as_bytes()[0], MULTIHASH_IDENTITY);
        assert_eq!(id.as_bytes()[1] as usize, id.as_bytes().len() - 2);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"attest");
        kp.public().verify(b"attest", &sig).unwrap();
        assert!(kp.public().verify(b"tamper", &sig).is_err());
    }

    #[test]
    fn load_or_generate_persists() {
        let dir = std::env::temp_dir().join(format!("cairn-id-test-{}", std::process::id()));
        let path = dir.join("identity.key");
        let _ = std::fs::remove_file(&path);

        let kp1 = Keypair::load_or_generate(&path).unwrap();
        let kp2 = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(kp1.peer_id(), kp2.peer_id());

        std::fs::remove_file(&path).unwrap();
        let _ = std::fs::remove_dir(&dir);
    }
}
