//! JSON codec for envelopes.
//!
//! One envelope per frame, encoded as UTF-8 JSON text. Inbound frames are
//! decoded into an [`InboundFrame`] first; whether it is a reply or a fresh
//! request is decided by the endpoint against its pending table, not by the
//! frame's shape.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::envelope::{ReplyEnvelope, RequestEnvelope, ID_FIELD, SENT_BY_FIELD};

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization or deserialization failed.
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame decoded to something other than a JSON object.
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// The frame has no string `id` field.
    #[error("Frame has no string `id` field")]
    MissingId,
}

/// Serialize an envelope to frame bytes.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode frame bytes into an [`InboundFrame`].
///
/// # Errors
///
/// Returns an error if the bytes are not JSON, not an object, or lack a
/// string `id`.
pub fn decode(bytes: &[u8]) -> Result<InboundFrame, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(fields) = value else {
        return Err(CodecError::NotAnObject);
    };
    let id = fields
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingId)?
        .to_string();
    Ok(InboundFrame { id, fields })
}

/// A decoded frame that has not been classified yet.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    id: String,
    fields: Map<String, Value>,
}

impl InboundFrame {
    /// Returns the correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true if the frame names a sender, i.e. it can be a request.
    #[must_use]
    pub fn has_sender(&self) -> bool {
        self.fields.contains_key(SENT_BY_FIELD)
    }

    /// Interpret the frame as a reply.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the fields do not form a reply.
    pub fn into_reply(self) -> Result<ReplyEnvelope, CodecError> {
        Ok(serde_json::from_value(Value::Object(self.fields))?)
    }

    /// Interpret the frame as a request.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if `sentBy` is missing or mistyped.
    pub fn into_request(self) -> Result<RequestEnvelope, CodecError> {
        Ok(serde_json::from_value(Value::Object(self.fields))?)
    }
}
