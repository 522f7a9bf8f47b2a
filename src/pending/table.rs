//! The pending request table.
//!
//! Maps correlation ids to the completion handles of requests that are still
//! waiting for a reply. Every mutation runs inside one short critical section
//! and completions are always fired after the lock is released.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::envelope::ReplyEnvelope;
use crate::pending::{IdGenerator, PendingError, ReplyError};

/// Outcome delivered to whoever awaits a [`PendingReply`].
pub type ReplyResult = Result<ReplyEnvelope, ReplyError>;

/// Settling side of a pending request.
#[derive(Debug)]
pub struct Completion {
    id: String,
    serial: u64,
    tx: oneshot::Sender<ReplyResult>,
    registered_at: Instant,
}

impl Completion {
    /// Returns the correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Time since the request was registered.
    #[must_use]
    pub(crate) fn elapsed(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Resolve with the reply if it reports success, reject with it otherwise.
    pub fn settle(self, reply: ReplyEnvelope) {
        let outcome = if reply.is_success() {
            Ok(reply)
        } else {
            Err(ReplyError::Rejected(reply))
        };
        self.finish(outcome);
    }

    /// Reject with the given error.
    pub fn reject(self, error: ReplyError) {
        self.finish(Err(error));
    }

    fn finish(self, outcome: ReplyResult) {
        let Self {
            id,
            tx,
            registered_at,
            ..
        } = self;
        if tx.send(outcome).is_err() {
            tracing::trace!(
                id = %id,
                waited = ?registered_at.elapsed(),
                "Pending reply receiver already dropped"
            );
        }
    }
}

/// Awaiting side of a pending request.
///
/// Resolves to the reply envelope on success. Dropping it does not remove
/// the table entry; use the endpoint's `cancel` for that.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    serial: u64,
    rx: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    /// Returns the correlation id this reply is waiting on.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ReplyError::Abandoned(self.id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn pair(id: String, serial: u64) -> (Completion, PendingReply) {
    let (tx, rx) = oneshot::channel();
    let completion = Completion {
        id: id.clone(),
        serial,
        tx,
        registered_at: Instant::now(),
    };
    (completion, PendingReply { id, serial, rx })
}

/// Table of requests awaiting a reply, keyed by correlation id.
///
/// All methods take `&self`; the map sits behind a mutex so replies arriving
/// on the receive task can race new registrations safely.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, Completion>>,
    next_serial: AtomicU64,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Completion>> {
        self.entries.lock().expect("pending table mutex poisoned")
    }

    fn next_pair(&self, id: String) -> (Completion, PendingReply) {
        pair(id, self.next_serial.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a caller-supplied id.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::DuplicateId`] if the id is already pending.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn register(&self, id: impl Into<String>) -> Result<PendingReply, PendingError> {
        let id = id.into();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(PendingError::DuplicateId(id));
        }
        let (completion, reply) = self.next_pair(id.clone());
        entries.insert(id, completion);
        Ok(reply)
    }

    /// Register a freshly generated id that does not collide with any
    /// pending entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn register_generated(&self, ids: &IdGenerator) -> PendingReply {
        let mut entries = self.lock();
        let id = loop {
            let candidate = ids.next_id();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
            tracing::warn!(id = %candidate, "Generated id collides with a pending request");
        };
        let (completion, reply) = self.next_pair(id.clone());
        entries.insert(id, completion);
        reply
    }

    /// Settle the entry matching `reply.id()`.
    ///
    /// Returns false, and does nothing else, when no such entry exists.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn settle(&self, reply: ReplyEnvelope) -> bool {
        let completion = self.lock().remove(reply.id());
        match completion {
            Some(completion) => {
                tracing::debug!(
                    id = %reply.id(),
                    success = reply.is_success(),
                    elapsed = ?completion.elapsed(),
                    "Settling pending request"
                );
                completion.settle(reply);
                true
            }
            None => {
                tracing::debug!(id = %reply.id(), "Discarding reply with no pending request");
                false
            }
        }
    }

    /// Remove and return the completion for `id`.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn take(&self, id: &str) -> Option<Completion> {
        self.lock().remove(id)
    }

    /// Remove the entry `pending` is waiting on.
    ///
    /// Returns `None` if that entry is gone, even when a newer request has
    /// since registered the same id.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn remove_for(&self, pending: &PendingReply) -> Option<Completion> {
        let mut entries = self.lock();
        match entries.get(pending.id()) {
            Some(completion) if completion.serial == pending.serial => entries.remove(pending.id()),
            _ => None,
        }
    }

    /// Reject the entry `pending` is waiting on with `error`.
    ///
    /// Returns false if it was already settled.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn reject_for(&self, pending: &PendingReply, error: ReplyError) -> bool {
        match self.remove_for(pending) {
            Some(completion) => {
                completion.reject(error);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` and reject it with `error`.
    ///
    /// Returns false if nothing was pending under that id.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn reject(&self, id: &str, error: ReplyError) -> bool {
        match self.take(id) {
            Some(completion) => {
                completion.reject(error);
                true
            }
            None => false,
        }
    }

    /// Reject every pending entry with a synthetic shutdown reply.
    ///
    /// Returns the number of entries drained.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    pub fn drain_all(&self, reason: &str) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for (id, completion) in drained {
            completion.reject(ReplyError::Shutdown(ReplyEnvelope::shutdown(id, reason)));
        }
        if count > 0 {
            tracing::debug!(count, reason, "Drained pending requests");
        }
        count
    }

    /// Number of pending entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is pending.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns true if `id` is pending.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Sorted ids of all pending entries, for diagnostics.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn success_reply_resolves_with_full_envelope() {
        let table = PendingTable::new();
        let pending = table.register("a-1").unwrap();

        let reply = ReplyEnvelope::new("a-1", true, json!({"response": "Hello world!"}));
        assert!(table.settle(reply.clone()));

        assert_eq!(pending.await, Ok(reply));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn failure_reply_rejects_with_full_envelope() {
        let table = PendingTable::new();
        let pending = table.register("a-1").unwrap();

        let reply = ReplyEnvelope::new("a-1", false, json!({"why": "busy"}));
        table.settle(reply.clone());

        assert_eq!(pending.await, Err(ReplyError::Rejected(reply)));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let table = PendingTable::new();
        let _first = table.register("a-1").unwrap();
        assert_eq!(
            table.register("a-1").unwrap_err(),
            PendingError::DuplicateId("a-1".to_string())
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn id_can_be_reused_after_settlement() {
        let table = PendingTable::new();
        let _first = table.register("a-1").unwrap();
        table.settle(ReplyEnvelope::new("a-1", true, json!({})));
        assert!(table.register("a-1").is_ok());
    }

    #[test]
    fn reply_for_one_id_leaves_others_pending() {
        let table = PendingTable::new();
        let mut first = task::spawn(table.register("id1").unwrap());
        let mut second = task::spawn(table.register("id2").unwrap());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        table.settle(ReplyEnvelope::new("id2", true, json!({"n": 2})));

        assert!(second.is_woken());
        let reply = assert_ready!(second.poll()).unwrap();
        assert_eq!(reply.get("n"), Some(&json!(2)));
        assert!(!first.is_woken());
        assert_pending!(first.poll());
        assert_eq!(table.pending_ids(), vec!["id1".to_string()]);
    }

    #[test]
    fn stale_reply_is_a_no_op() {
        let table = PendingTable::new();
        let _pending = table.register("a-1").unwrap();

        assert!(!table.settle(ReplyEnvelope::new("never-sent", true, json!({}))));
        assert_eq!(table.pending_ids(), vec!["a-1".to_string()]);
    }

    #[test]
    fn second_reply_for_same_id_is_discarded() {
        let table = PendingTable::new();
        let _pending = table.register("a-1").unwrap();
        assert!(table.settle(ReplyEnvelope::new("a-1", true, json!({}))));
        assert!(!table.settle(ReplyEnvelope::new("a-1", false, json!({}))));
    }

    #[tokio::test]
    async fn drain_rejects_everything_with_reason() {
        let table = PendingTable::new();
        let first = table.register("id1").unwrap();
        let second = table.register("id2").unwrap();

        assert_eq!(table.drain_all("endpoint destroyed"), 2);
        assert!(table.is_empty());

        for pending in [first, second] {
            let err = pending.await.unwrap_err();
            assert!(err.is_shutdown());
            assert_eq!(
                err.envelope().and_then(ReplyEnvelope::shutdown_reason),
                Some("endpoint destroyed")
            );
        }

        assert_eq!(table.drain_all("endpoint destroyed"), 0);
    }

    #[tokio::test]
    async fn reject_single_entry() {
        let table = PendingTable::new();
        let pending = table.register("a-1").unwrap();
        assert!(table.reject("a-1", ReplyError::Cancelled("a-1".to_string())));
        assert!(!table.reject("a-1", ReplyError::Cancelled("a-1".to_string())));
        assert_eq!(pending.await, Err(ReplyError::Cancelled("a-1".to_string())));
    }

    #[test]
    fn generated_ids_skip_pending_entries() {
        let table = PendingTable::new();
        let ids = IdGenerator::new("alpha");
        let first = table.register_generated(&ids);
        let second = table.register_generated(&ids);
        assert_ne!(first.id(), second.id());
        assert!(table.contains(first.id()));
        assert!(table.contains(second.id()));
    }

    #[tokio::test]
    async fn dropped_completion_reports_abandoned() {
        let table = PendingTable::new();
        let pending = table.register("a-1").unwrap();
        drop(table.take("a-1"));
        assert_eq!(pending.await, Err(ReplyError::Abandoned("a-1".to_string())));
    }

    #[tokio::test]
    async fn reject_for_leaves_a_newer_request_with_the_same_id_alone() {
        let table = PendingTable::new();
        let mut stale = table.register("r1").unwrap();
        assert!(table.settle(ReplyEnvelope::new("r1", true, json!({"n": 1}))));
        let fresh = table.register("r1").unwrap();

        let timed_out = ReplyError::TimedOut {
            id: "r1".to_string(),
            ms: 10,
        };
        assert!(!table.reject_for(&stale, timed_out.clone()));
        assert!(table.remove_for(&stale).is_none());
        assert!(table.contains("r1"));

        // The first request still sees the reply that beat the deadline.
        assert_eq!((&mut stale).await.unwrap().get("n"), Some(&json!(1)));

        assert!(table.reject_for(&fresh, timed_out.clone()));
        assert!(table.is_empty());
        assert_eq!(fresh.await, Err(timed_out));
    }

    #[test]
    fn settle_after_receiver_dropped_does_not_panic() {
        let table = PendingTable::new();
        drop(table.register("a-1").unwrap());
        assert!(table.settle(ReplyEnvelope::new("a-1", true, json!({}))));
    }
}
