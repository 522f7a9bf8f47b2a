//! Correlation id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates correlation ids for one endpoint.
///
/// Ids have the form `<prefix>-<epoch_ms>-<seq>`. The prefix is the endpoint
/// identity, the epoch is taken once when the generator is created and tells
/// restarts of the same endpoint apart, and `seq` increases strictly. Ids are
/// therefore unique per generator, but nothing stops a caller from supplying
/// the same string by hand, so the pending table still checks for collisions.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    epoch_ms: i64,
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator for the given endpoint identity.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            epoch_ms: chrono::Utc::now().timestamp_millis(),
            next: AtomicU64::new(1),
        }
    }

    /// Returns the id prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Produce the next id.
    pub fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{seq}", self.prefix, self.epoch_ms)
    }
}
