//! Inbound requests and their reply contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::endpoint::ChannelError;
use crate::envelope::{self, ReplyEnvelope, RequestEnvelope};
use crate::transport::Link;

/// Something that can write a frame back on a link.
#[async_trait]
pub(crate) trait FrameWriter: Send + Sync {
    async fn write_frame(&self, link: &Link, frame: Vec<u8>) -> Result<(), ChannelError>;
}

/// A request received from a peer.
///
/// Cloning is cheap and all clones share one replied flag, so the message
/// can be answered at most once no matter how many handlers saw it.
#[derive(Clone)]
pub struct InboundMessage {
    id: String,
    sent_by: String,
    data: Value,
    success: Option<bool>,
    link: Link,
    replied: Arc<AtomicBool>,
    writer: Weak<dyn FrameWriter>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("sent_by", &self.sent_by)
            .field("data", &self.data)
            .field("link", &self.link)
            .field("replied", &self.is_replied())
            .finish_non_exhaustive()
    }
}

impl InboundMessage {
    pub(crate) fn new(request: RequestEnvelope, link: Link, writer: Weak<dyn FrameWriter>) -> Self {
        Self {
            id: request.id,
            sent_by: request.sent_by,
            data: request.data,
            success: request.success,
            link,
            replied: Arc::new(AtomicBool::new(false)),
            writer,
        }
    }

    /// Correlation id of the request.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the sending endpoint.
    #[must_use]
    pub fn sent_by(&self) -> &str {
        &self.sent_by
    }

    /// Request payload.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Success hint, present when the sender used the responder-side variant.
    #[must_use]
    pub fn success_hint(&self) -> Option<bool> {
        self.success
    }

    /// Link the request arrived on.
    #[must_use]
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Returns true once a reply has been attempted.
    #[must_use]
    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Reply with `success: true`.
    ///
    /// # Errors
    ///
    /// See [`InboundMessage::reply_with`].
    pub async fn reply(&self, data: Value) -> Result<(), ChannelError> {
        self.reply_with(data, true).await
    }

    /// Reply with an explicit outcome.
    ///
    /// The reply is `{id, success, ...data}`; `id` and `success` keys inside
    /// `data` are ignored. A reply is terminal and registers nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyReplied`] on any call after the first,
    /// [`ChannelError::Destroyed`] if the receiving endpoint is gone, or the
    /// transport's error if the write fails.
    pub async fn reply_with(&self, data: Value, success: bool) -> Result<(), ChannelError> {
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyReplied(self.id.clone()));
        }

        let envelope = ReplyEnvelope::new(self.id.clone(), success, data);
        let frame = envelope::encode(&envelope)?;
        let writer = self.writer.upgrade().ok_or(ChannelError::Destroyed)?;

        tracing::debug!(id = %self.id, link = %self.link, success, "Replying to request");
        writer.write_frame(&self.link, frame).await
    }
}
