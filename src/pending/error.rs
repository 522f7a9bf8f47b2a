//! Pending request error types.

use crate::envelope::ReplyEnvelope;

/// Errors raised when registering a pending request.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PendingError {
    /// A request with this id is already awaiting a reply.
    #[error("Request id already pending: {0}")]
    DuplicateId(String),
}

/// Ways a pending request can fail to produce a successful reply.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReplyError {
    /// The responder answered with `success` other than `true`.
    #[error("Request {} rejected by responder", .0.id())]
    Rejected(ReplyEnvelope),

    /// The endpoint was destroyed while the request was pending.
    #[error("Request {} rejected: {}", .0.id(), .0.shutdown_reason().unwrap_or_default())]
    Shutdown(ReplyEnvelope),

    /// The request was cancelled locally.
    #[error("Request {0} cancelled")]
    Cancelled(String),

    /// No reply arrived within the caller's deadline.
    #[error("Request {id} timed out after {ms}ms")]
    TimedOut { id: String, ms: u64 },

    /// The completion handle was dropped without being settled.
    #[error("Request {0} abandoned before a reply arrived")]
    Abandoned(String),
}

impl ReplyError {
    /// Returns the reply envelope this failure carries, if any.
    #[must_use]
    pub fn envelope(&self) -> Option<&ReplyEnvelope> {
        match self {
            Self::Rejected(reply) | Self::Shutdown(reply) => Some(reply),
            _ => None,
        }
    }

    /// Returns true if this failure came from endpoint teardown.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown(_))
    }
}
