//! Pubsub RPC wire schema and message signing.
//!
//! One length-prefixed protobuf RPC per wire message, carrying subscription
//! changes, application messages, and (for gossipsub) a control block.
//! Signatures cover `"libp2p-pubsub:" || encode(message sans signature/key)`
//! and verify under the key carried in the message.

use prost::Message as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

use cairn_core::identity::IdentityError;
use cairn_core::{Keypair, PublicKey};

/// Upper bound on one encoded RPC.
pub const MAX_RPC_SIZE: usize = 65_536;

/// Domain-separation prefix for message signatures.
const SIGN_PREFIX: &[u8] = b"libp2p-pubsub:";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Rpc {
    #[prost(message, repeated, tag = "1")]
    pub subscriptions: Vec<SubOpts>,
    #[prost(message, repeated, tag = "2")]
    pub publish: Vec<Message>,
    #[prost(message, optional, tag = "3")]
    pub control: Option<ControlMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubOpts {
    #[prost(bool, optional, tag = "1")]
    pub subscribe: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub topic_id: Option<String>,
}

/// An application message in flight.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// PeerId bytes of the original publisher.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub from: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    /// 8-byte big-endian sequence number, unique per publisher.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub seqno: Option<Vec<u8>>,
    #[prost(string, repeated, tag = "4")]
    pub topic_ids: Vec<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub key: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlMessage {
    #[prost(message, repeated, tag = "1")]
    pub ihave: Vec<ControlIHave>,
    #[prost(message, repeated, tag = "2")]
    pub iwant: Vec<ControlIWant>,
    #[prost(message, repeated, tag = "3")]
    pub graft: Vec<ControlGraft>,
    #[prost(message, repeated, tag = "4")]
    pub prune: Vec<ControlPrune>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlIHave {
    #[prost(string, optional, tag = "1")]
    pub topic_id: Option<String>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub message_ids: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlIWant {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub message_ids: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlGraft {
    #[prost(string, optional, tag = "1")]
    pub topic_id: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlPrune {
    #[prost(string, optional, tag = "1")]
    pub topic_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("message carries no key")]
    MissingKey,

    #[error("signature missing")]
    MissingSignature,

    #[error("key does not match the message's from field")]
    FromMismatch,

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// SHA-256 fingerprint of raw bytes — the dedup-cache key.
pub fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn signable(msg: &Message) -> Vec<u8> {
    let mut unsigned = msg.clone();
    unsigned.signature = None;
    unsigned.key = None;
    let encoded = unsigned.encode_to_vec();
    let mut out = Vec::with_capacity(SIGN_PREFIX.len() + encoded.len());
    out.extend_from_slice(SIGN_PREFIX);
    out.extend_from_slice(&encoded);
    out
}

/// Attach the publisher's key and signature.
pub fn sign_message(msg: &mut Message, keypair: &Keypair) {
    let payload = signable(msg);
    msg.key = Some(keypair.public().encode_protobuf());
    msg.signature = Some(keypair.sign(&payload));
}

/// Verify a signed message: the signature must check out under the carried
/// key, and the key must belong to the claimed publisher.
pub fn verify_message(msg: &Message) -> Result<(), SignError> {
    let key_bytes = msg.key.as_ref().ok_or(SignError::MissingKey)?;
    let signature = msg.signature.as_ref().ok_or(SignError::MissingSignature)?;
    let key = PublicKey::decode_protobuf(key_bytes)?;
    if let Some(from) = &msg.from {
        if key.to_peer_id().as_bytes() != from.as_slice() {
            return Err(SignError::FromMismatch);
        }
    }
    key.verify(&signable(msg), signature)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
