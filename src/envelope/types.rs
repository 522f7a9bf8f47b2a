//! Envelope types.
//!
//! This module defines the request and reply envelopes exchanged between
//! two endpoints. Both are plain JSON objects on the wire.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Correlation field shared by both envelope kinds.
pub const ID_FIELD: &str = "id";

/// Outcome flag on reply envelopes.
pub const SUCCESS_FIELD: &str = "success";

/// Sender identity on request envelopes.
pub const SENT_BY_FIELD: &str = "sentBy";

/// Reserved field carried by synthetic shutdown rejections.
pub const REASON_FIELD: &str = "__reason";

/// Key used when a reply payload is not a JSON object and cannot be merged.
pub const DATA_FIELD: &str = "data";

/// Envelope sent from requester to responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    /// Correlation token.
    pub id: String,
    /// Name of the sending endpoint.
    #[serde(rename = "sentBy")]
    pub sent_by: String,
    /// Opaque application payload.
    #[serde(default)]
    pub data: Value,
    /// Outcome hint, only present on the responder-side variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl RequestEnvelope {
    /// Create a request envelope without a success hint.
    #[must_use]
    pub fn new(id: impl Into<String>, sent_by: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            sent_by: sent_by.into(),
            data,
            success: None,
        }
    }

    /// Attach the responder-side success hint.
    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }
}

/// Envelope sent from responder back to requester.
///
/// The responder's fields are flattened next to `id` and `success`. They can
/// never shadow those two keys: [`ReplyEnvelope::new`] strips them before the
/// merge and deserialization consumes them into the typed fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    id: String,
    #[serde(default = "default_success", deserialize_with = "deserialize_success")]
    success: bool,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

fn default_success() -> bool {
    true
}

/// Anything other than a literal `true` counts as failure.
fn deserialize_success<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value == Value::Bool(true))
}

impl ReplyEnvelope {
    /// Build a reply from a responder payload.
    ///
    /// Object payloads are merged field by field, minus any `id` or `success`
    /// keys. `null` contributes nothing. Any other value is kept under `data`.
    #[must_use]
    pub fn new(id: impl Into<String>, success: bool, data: Value) -> Self {
        let fields = match data {
            Value::Object(mut map) => {
                map.remove(ID_FIELD);
                map.remove(SUCCESS_FIELD);
                map
            }
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert(DATA_FIELD.to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            success,
            fields,
        }
    }

    /// Synthetic rejection used when an endpoint is torn down.
    #[must_use]
    pub fn shutdown(id: impl Into<String>, reason: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(REASON_FIELD.to_string(), Value::String(reason.to_string()));
        Self {
            id: id.into(),
            success: false,
            fields,
        }
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true if the responder reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Returns the responder's fields, without `id` and `success`.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns a single responder field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns the shutdown reason if this is a synthetic teardown rejection.
    #[must_use]
    pub fn shutdown_reason(&self) -> Option<&str> {
        self.fields.get(REASON_FIELD).and_then(Value::as_str)
    }

    /// Flatten into the wire object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        map.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        map.insert(SUCCESS_FIELD.to_string(), Value::Bool(self.success));
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}
