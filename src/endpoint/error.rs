//! Endpoint error types.

use crate::envelope::{CodecError, ReplyEnvelope};
use crate::pending::{PendingError, ReplyError};
use crate::transport::TransportError;

/// Errors surfaced by a channel endpoint.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// A link to the peer could not be established or was lost.
    #[error("Failed to connect to {peer}: {reason}")]
    Connection { peer: String, reason: String },

    /// The inbound message has already been replied to.
    #[error("Message {0} has already been replied to")]
    AlreadyReplied(String),

    /// The payload carries an `id` that is not a string.
    #[error("Payload `id` must be a string")]
    InvalidId,

    /// The endpoint has been destroyed.
    #[error("Endpoint has been destroyed")]
    Destroyed,

    /// The request could not be registered.
    #[error(transparent)]
    Pending(#[from] PendingError),

    /// The request did not produce a successful reply.
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// A frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ChannelError {
    pub(crate) fn connection(peer: &str, reason: impl Into<String>) -> Self {
        Self::Connection {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the reply envelope carried by a rejection, if any.
    #[must_use]
    pub fn reply(&self) -> Option<&ReplyEnvelope> {
        match self {
            Self::Reply(error) => error.envelope(),
            _ => None,
        }
    }
}
