//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reason attached to requests rejected by endpoint teardown.
pub const DEFAULT_SHUTDOWN_REASON: &str = "endpoint destroyed";

/// Configuration for one channel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Identity of this endpoint; sent as `sentBy` and used as the served name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Reason carried by synthetic rejections on destroy.
    #[serde(default = "default_shutdown_reason")]
    pub shutdown_reason: String,
    /// Default reply deadline for `send`, in milliseconds. Unset waits forever.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Prefix for generated correlation ids. Defaults to `name`.
    #[serde(default)]
    pub id_prefix: Option<String>,
}

fn default_name() -> String {
    "courier".to_string()
}

fn default_shutdown_reason() -> String {
    DEFAULT_SHUTDOWN_REASON.to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            shutdown_reason: default_shutdown_reason(),
            request_timeout_ms: None,
            id_prefix: None,
        }
    }
}

impl EndpointConfig {
    /// Create a configuration for the named endpoint.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the default reply deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the shutdown reason.
    #[must_use]
    pub fn with_shutdown_reason(mut self, reason: impl Into<String>) -> Self {
        self.shutdown_reason = reason.into();
        self
    }

    /// Set the id prefix.
    #[must_use]
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    /// Default reply deadline, if configured.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Prefix for generated ids.
    #[must_use]
    pub fn id_prefix(&self) -> &str {
        self.id_prefix.as_deref().unwrap_or(&self.name)
    }
}
