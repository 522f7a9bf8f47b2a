//! Channel endpoints.
//!
//! A [`ChannelEndpoint`] wraps a [`Transport`](crate::transport::Transport)
//! and gives it request/reply semantics:
//!
//! - `send` registers a correlation id, writes the request and resolves when
//!   the matching reply arrives.
//! - Incoming requests surface as [`InboundMessage`]s through `on_message`
//!   and are answered with `reply` or `reply_with`, at most once.
//! - `destroy` rejects every outstanding request with a shutdown reply and
//!   releases the transport.

mod channel;
mod error;
mod events;
mod message;

pub use channel::{ChannelEndpoint, SendOptions};
pub use error::ChannelError;
pub use events::{EndpointEvent, PeerStatus};
pub(crate) use events::Handlers;
pub use message::InboundMessage;
