//! Peer connections: transport seam, perfect negotiation, data channels.

pub mod channels;
pub mod mock;
pub mod negotiator;
pub mod send_queue;
pub mod transport;
pub mod webrtc;

pub use channels::{ChannelManager, ChannelNotice, ChannelRegistry};
pub use negotiator::{ConnectionNegotiator, ConnectionRegistry, NegotiatorEvent};
pub use transport::{PeerTransport, PeerTransportFactory};
