//! cairn-pubsub — publish/subscribe routing over the switch.
//!
//! FloodSub (`/floodsub/1.0.0`) forwards every message to every subscribed
//! peer; GossipSub (`/meshsub/1.0.0`) restricts forwarding to a per-topic
//! mesh maintained with graft/prune and fills gaps with IHAVE/IWANT gossip.
//! Both share deduplication, signing, validation, and send recycling.

pub mod cache;
pub mod gossipsub;
pub mod peer;
pub mod router;
pub mod rpc;

pub use cache::TimedCache;
pub use gossipsub::{GossipSub, GossipsubConfig, GOSSIPSUB_ID};
pub use router::{
    FloodSub, MessageIdFn, MessageObserver, PubSubConfig, RouterCore, TopicHandler, Validator,
    FLOODSUB_ID,
};
pub use rpc::{Message, Rpc, MAX_RPC_SIZE};
