//! IPC Courier - correlated request/reply messaging over named local channels.

pub mod config;
pub mod display;
pub mod endpoint;
pub mod envelope;
pub mod pending;
pub mod transport;

pub use config::{ConfigLoader, EndpointConfig};
pub use endpoint::{ChannelEndpoint, ChannelError, EndpointEvent, InboundMessage, PeerStatus, SendOptions};
pub use envelope::{ReplyEnvelope, RequestEnvelope};
pub use pending::ReplyError;
pub use transport::{Link, MemoryHub, MemoryTransport, Transport};
