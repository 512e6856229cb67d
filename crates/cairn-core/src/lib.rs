//! cairn-core — identity, wire helpers, and the byte-stream seam.
//! All other Cairn crates depend on this one.

pub mod config;
pub mod identity;
pub mod stream;
pub mod tracker;
pub mod varint;

pub use identity::{Keypair, PeerId, PeerInfo, PublicKey};
pub use stream::{ByteStream, Direction, StreamError};
