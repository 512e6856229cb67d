//! cairn-net — the connection pipeline.
//!
//! Raw socket → Noise XX secure channel → mplex session → multistream-
//! negotiated application channels, orchestrated by the switch.

pub mod mplex;
pub mod multistream;
pub mod noise;
pub mod switch;
pub mod transport;

pub use mplex::{Channel, MuxError, Session, SessionConfig};
pub use multistream::{NegotiationError, ProtocolMatcher};
pub use noise::{NoiseError, SecureStream};
pub use switch::{
    ConnectionEvent, ConnectionHook, PeerEvent, PeerHook, ProtocolHandler, SessionHandle, Switch,
    SwitchConfig, SwitchError,
};
pub use transport::{Listener, RawConnection, TcpTransport, Transport, TransportError};
