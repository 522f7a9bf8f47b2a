//! The channel endpoint.
//!
//! Owns the pending table and the peer registry, drives the send and
//! connect paths, and runs the receive task that turns transport events
//! into settled replies and inbound messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EndpointConfig;
use crate::endpoint::message::FrameWriter;
use crate::endpoint::{ChannelError, EndpointEvent, Handlers, InboundMessage, PeerStatus};
use crate::envelope::{self, ReplyEnvelope, RequestEnvelope, ID_FIELD};
use crate::pending::{IdGenerator, PendingReply, PendingTable, ReplyError};
use crate::transport::{Link, LinkAttempt, LinkSignal, Transport, TransportEvent};

/// Per-call options for [`ChannelEndpoint::send_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Success hint for the responder-side request variant.
    pub success: Option<bool>,
    /// Reply deadline; overrides the configured default.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Options with nothing set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a success hint to the outgoing request.
    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    /// Give up waiting after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Inner<T: Transport> {
    config: EndpointConfig,
    transport: T,
    pending: PendingTable,
    ids: IdGenerator,
    peers: Mutex<HashMap<String, Link>>,
    handlers: Handlers,
    serving: AtomicBool,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
}

impl<T: Transport> Inner<T> {
    fn peers(&self) -> MutexGuard<'_, HashMap<String, Link>> {
        self.peers.lock().expect("peer registry mutex poisoned")
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Register `peer` unless teardown has begun.
    ///
    /// The destroyed flag is read under the registry lock, so a peer inserted
    /// here is always seen by the drain in `destroy`.
    fn register_peer(&self, peer: &str, link: &Link) -> bool {
        let mut peers = self.peers();
        if self.is_destroyed() {
            return false;
        }
        peers.insert(peer.to_string(), link.clone());
        true
    }

    /// Deregister `peer` if it is still bound to `link`.
    fn forget_peer(&self, peer: &str, link: &Link) -> bool {
        let mut peers = self.peers();
        if peers.get(peer) == Some(link) {
            peers.remove(peer);
            true
        } else {
            false
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl<T: Transport> FrameWriter for Inner<T> {
    async fn write_frame(&self, link: &Link, frame: Vec<u8>) -> Result<(), ChannelError> {
        if self.is_destroyed() {
            return Err(ChannelError::Destroyed);
        }
        Ok(self.transport.write(link, frame).await?)
    }
}

/// One process's participant in a request/reply channel.
///
/// Cloning yields another handle to the same endpoint.
pub struct ChannelEndpoint<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ChannelEndpoint<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for ChannelEndpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("name", &self.inner.config.name)
            .field("transport", &self.inner.transport)
            .field("pending", &self.inner.pending.len())
            .field("handlers", &self.inner.handlers)
            .field("destroyed", &self.inner.is_destroyed())
            .finish()
    }
}

impl<T: Transport> ChannelEndpoint<T> {
    /// Create an endpoint that owns `transport`.
    ///
    /// Attaches to the transport and spawns the receive task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: EndpointConfig, transport: T) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        transport.attach(sink);

        let inner = Arc::new(Inner {
            ids: IdGenerator::new(config.id_prefix()),
            config,
            transport,
            pending: PendingTable::new(),
            peers: Mutex::new(HashMap::new()),
            handlers: Handlers::default(),
            serving: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(receive_loop(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    /// Endpoint identity.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Endpoint configuration.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// The owned transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    fn ensure_live(&self) -> Result<(), ChannelError> {
        if self.inner.is_destroyed() {
            Err(ChannelError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Start accepting links under the endpoint's name.
    ///
    /// Calling it again while serving is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Destroyed`] after teardown, or the transport's
    /// error if it cannot serve the name.
    pub async fn start(&self) -> Result<(), ChannelError> {
        self.ensure_live()?;
        if self.inner.serving.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(error) = self.inner.transport.serve(self.name()).await {
            self.inner.serving.store(false, Ordering::Release);
            return Err(error.into());
        }

        tracing::info!(name = %self.name(), "Endpoint started");
        self.inner.handlers.dispatch(EndpointEvent::Started {
            name: self.name().to_string(),
        });
        Ok(())
    }

    /// Establish a link to `peer` unless one is already known.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connection`] if the link is refused, closed or
    /// destroyed before it is established.
    ///
    /// # Panics
    ///
    /// Panics if the peer registry `Mutex` is poisoned.
    pub async fn connect_to(&self, peer: &str) -> Result<Link, ChannelError> {
        self.ensure_live()?;
        if let Some(link) = self.inner.peers().get(peer).cloned() {
            return Ok(link);
        }

        tracing::debug!(peer, "Connecting to peer");
        let attempt = self.inner.transport.connect_to(peer).await;
        self.ensure_live()?;
        let mut attempt = attempt.map_err(|e| ChannelError::connection(peer, e.to_string()))?;

        loop {
            match attempt.recv().await {
                Some(LinkSignal::Connected(link)) => {
                    if !self.inner.register_peer(peer, &link) {
                        tracing::debug!(peer, link = %link, "Link established after destroy, dropping it");
                        self.inner.transport.disconnect(peer).await;
                        return Err(ChannelError::Destroyed);
                    }
                    tracing::info!(peer, link = %link, "Peer connected");
                    self.inner.handlers.dispatch(EndpointEvent::PeerConnected {
                        link: link.clone(),
                    });
                    tokio::spawn(watch_link(
                        Arc::downgrade(&self.inner),
                        peer.to_string(),
                        link.clone(),
                        attempt,
                        self.inner.shutdown.clone(),
                    ));
                    return Ok(link);
                }
                Some(LinkSignal::Refused(reason)) => {
                    return Err(ChannelError::connection(peer, reason));
                }
                Some(LinkSignal::Closed) => {
                    return Err(ChannelError::connection(
                        peer,
                        "link closed before it was established",
                    ));
                }
                Some(LinkSignal::Destroyed) => {
                    self.inner.peers().remove(peer);
                    return Err(ChannelError::connection(peer, "link destroyed"));
                }
                Some(LinkSignal::Notice(note)) => {
                    tracing::trace!(peer, note = %note, "Link notice");
                }
                None => {
                    return Err(ChannelError::connection(
                        peer,
                        "transport abandoned the link attempt",
                    ));
                }
            }
        }
    }

    /// Send `payload` to `peer` and wait for the reply.
    ///
    /// Uses the configured default timeout, if any.
    ///
    /// # Errors
    ///
    /// See [`ChannelEndpoint::send_with`].
    pub async fn send(&self, peer: &str, payload: Value) -> Result<ReplyEnvelope, ChannelError> {
        self.send_with(peer, payload, SendOptions::default()).await
    }

    /// Send `payload` to `peer` with explicit options and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns everything [`ChannelEndpoint::dispatch`] does, plus
    /// [`ChannelError::Reply`] when the responder rejects, the endpoint is
    /// destroyed, the request is cancelled, or the deadline passes.
    pub async fn send_with(
        &self,
        peer: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<ReplyEnvelope, ChannelError> {
        let timeout = options
            .timeout
            .or_else(|| self.inner.config.request_timeout());
        let mut pending = self.dispatch(peer, payload, options.success).await?;

        let Some(limit) = timeout else {
            return Ok(pending.await?);
        };

        if let Ok(outcome) = tokio::time::timeout(limit, &mut pending).await {
            return Ok(outcome?);
        }

        // A reply that lands after the deadline but before this point still
        // wins; whatever reached the handle is the result.
        let id = pending.id().to_string();
        let ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        if self
            .inner
            .pending
            .reject_for(&pending, ReplyError::TimedOut { id: id.clone(), ms })
        {
            tracing::debug!(id = %id, peer, ms, "Request timed out");
        }
        Ok(pending.await?)
    }

    /// Register and transmit a request, returning the live pending handle.
    ///
    /// A string `id` inside `payload` is reused as the correlation id;
    /// otherwise a fresh one is generated.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connection`] if the peer cannot be reached,
    /// [`ChannelError::InvalidId`] for a non-string `id`,
    /// [`ChannelError::Pending`] if the supplied id is already pending, and
    /// [`ChannelError::Transport`] if the write fails. In every error case
    /// nothing is left pending.
    ///
    /// # Panics
    ///
    /// Panics if the peer registry `Mutex` is poisoned.
    pub async fn dispatch(
        &self,
        peer: &str,
        payload: Value,
        success: Option<bool>,
    ) -> Result<PendingReply, ChannelError> {
        self.ensure_live()?;
        let link = self.connect_to(peer).await?;

        let pending = match payload.get(ID_FIELD) {
            Some(Value::String(id)) => self.inner.pending.register(id.clone())?,
            Some(_) => return Err(ChannelError::InvalidId),
            None => self.inner.pending.register_generated(&self.inner.ids),
        };
        // Teardown may have drained the table while we were connecting.
        if self.inner.is_destroyed() {
            self.inner.pending.remove_for(&pending);
            return Err(ChannelError::Destroyed);
        }

        let mut request = RequestEnvelope::new(pending.id(), self.name(), payload);
        if let Some(success) = success {
            request = request.with_success(success);
        }
        let frame = match envelope::encode(&request) {
            Ok(frame) => frame,
            Err(error) => {
                self.inner.pending.remove_for(&pending);
                return Err(error.into());
            }
        };

        tracing::debug!(id = %pending.id(), peer, link = %link, "Sending request");
        if let Err(error) = self.inner.transport.write(&link, frame).await {
            tracing::warn!(id = %pending.id(), peer, error = %error, "Failed to transmit request");
            self.inner.pending.remove_for(&pending);
            self.inner.forget_peer(peer, &link);
            return Err(error.into());
        }
        Ok(pending)
    }

    /// Reject the pending request `id` with [`ReplyError::Cancelled`].
    ///
    /// Returns false if nothing was pending under that id.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self
            .inner
            .pending
            .reject(id, ReplyError::Cancelled(id.to_string()));
        if cancelled {
            tracing::debug!(id, "Request cancelled");
        }
        cancelled
    }

    /// Tear the endpoint down.
    ///
    /// Rejects every pending request with a shutdown reply, disconnects all
    /// known peers, stops the transport, emits `Stopped` and releases every
    /// handler. Later calls do nothing.
    ///
    /// # Panics
    ///
    /// Panics if the peer registry `Mutex` is poisoned.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = self
            .inner
            .pending
            .drain_all(&self.inner.config.shutdown_reason);
        let peers: Vec<String> = self.inner.peers().drain().map(|(name, _)| name).collect();
        for peer in &peers {
            self.inner.transport.disconnect(peer).await;
        }
        if self.inner.serving.swap(false, Ordering::AcqRel) {
            tracing::debug!(name = %self.name(), "Stopped serving");
        }
        self.inner.transport.stop().await;

        tracing::info!(
            name = %self.name(),
            drained,
            peers = peers.len(),
            "Endpoint destroyed"
        );
        self.inner.handlers.dispatch(EndpointEvent::Stopped {
            name: self.name().to_string(),
        });
        self.inner.handlers.clear();
        self.inner.shutdown.cancel();
    }

    /// Register a handler for inbound requests.
    ///
    /// Handlers run on the receive task and must not block; spawn a task to
    /// do real work and reply from there.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.inner.handlers.add_message(Arc::new(handler));
    }

    /// Register a handler for `Started`.
    pub fn on_start<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.handlers.add_start(Arc::new(handler));
    }

    /// Register a handler for `Stopped`.
    pub fn on_stop<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.handlers.add_stop(Arc::new(handler));
    }

    /// Register a handler for transport and decoding errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.inner.handlers.add_error(Arc::new(handler));
    }

    /// Register a handler for link state changes.
    pub fn on_peer<F>(&self, handler: F)
    where
        F: Fn(PeerStatus, &Link) + Send + Sync + 'static,
    {
        self.inner.handlers.add_peer(Arc::new(handler));
    }

    /// Register a handler that sees every event.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&EndpointEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.add_any(Arc::new(handler));
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sorted ids of requests awaiting a reply.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner.pending.pending_ids()
    }

    /// Sorted names of peers with an established link.
    #[must_use]
    pub fn known_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.peers().keys().cloned().collect();
        peers.sort_unstable();
        peers
    }

    /// Returns true if a link to `peer` is established.
    #[must_use]
    pub fn is_known(&self, peer: &str) -> bool {
        self.inner.peers().contains_key(peer)
    }

    /// Returns true once [`ChannelEndpoint::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

async fn receive_loop<T: Transport>(
    inner: Weak<Inner<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        handle_event(&inner, event);
    }
    tracing::debug!("Receive loop stopped");
}

fn handle_event<T: Transport>(inner: &Arc<Inner<T>>, event: TransportEvent) {
    match event {
        TransportEvent::Frame { link, bytes } => handle_frame(inner, link, &bytes),
        TransportEvent::Connected { link } => {
            tracing::debug!(link = %link, "Inbound link connected");
            inner
                .handlers
                .dispatch(EndpointEvent::PeerConnected { link });
        }
        TransportEvent::Disconnected { link } => {
            tracing::debug!(link = %link, "Inbound link disconnected");
            inner
                .handlers
                .dispatch(EndpointEvent::PeerDisconnected { link });
        }
        TransportEvent::Destroyed { link } => {
            tracing::debug!(link = %link, "Inbound link destroyed");
            inner
                .handlers
                .dispatch(EndpointEvent::PeerDestroyed { link });
        }
        TransportEvent::Error(error) => {
            tracing::warn!(error = %error, "Transport error");
            inner.handlers.dispatch(EndpointEvent::Error(error.into()));
        }
    }
}

fn handle_frame<T: Transport>(inner: &Arc<Inner<T>>, link: Link, bytes: &[u8]) {
    let frame = match envelope::decode(bytes) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(link = %link, error = %error, "Dropping malformed frame");
            inner.handlers.dispatch(EndpointEvent::Error(error.into()));
            return;
        }
    };

    // Lookup and removal happen together, so a reply can settle at most once.
    if let Some(completion) = inner.pending.take(frame.id()) {
        match frame.into_reply() {
            Ok(reply) => {
                tracing::debug!(
                    id = %reply.id(),
                    success = reply.is_success(),
                    elapsed = ?completion.elapsed(),
                    "Reply received"
                );
                completion.settle(reply);
            }
            Err(error) => {
                let id = completion.id().to_string();
                tracing::warn!(id = %id, error = %error, "Dropping undecodable reply");
                completion.reject(ReplyError::Abandoned(id));
                inner.handlers.dispatch(EndpointEvent::Error(error.into()));
            }
        }
        return;
    }

    if !frame.has_sender() {
        tracing::debug!(id = %frame.id(), link = %link, "Discarding reply with no pending request");
        return;
    }

    match frame.into_request() {
        Ok(request) => {
            tracing::debug!(id = %request.id, sent_by = %request.sent_by, "Request received");
            let weak = Arc::downgrade(inner);
            let writer: Weak<dyn FrameWriter> = weak;
            let message = InboundMessage::new(request, link, writer);
            inner.handlers.dispatch(EndpointEvent::Message(message));
        }
        Err(error) => {
            tracing::warn!(link = %link, error = %error, "Dropping malformed request");
            inner.handlers.dispatch(EndpointEvent::Error(error.into()));
        }
    }
}

/// Follow an established outgoing link until it goes away.
async fn watch_link<T: Transport>(
    inner: Weak<Inner<T>>,
    peer: String,
    link: Link,
    mut attempt: LinkAttempt,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;

            () = shutdown.cancelled() => return,

            signal = attempt.recv() => signal,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let status = match signal {
            Some(LinkSignal::Closed) | None => PeerStatus::Disconnected,
            Some(LinkSignal::Destroyed) => PeerStatus::Destroyed,
            Some(LinkSignal::Notice(note)) => {
                tracing::trace!(peer = %peer, note = %note, "Link notice");
                continue;
            }
            Some(other) => {
                tracing::trace!(peer = %peer, signal = ?other, "Ignoring signal on established link");
                continue;
            }
        };

        inner.forget_peer(&peer, &link);
        tracing::info!(peer = %peer, link = %link, status = ?status, "Peer link lost");
        let event = match status {
            PeerStatus::Destroyed => EndpointEvent::PeerDestroyed { link },
            _ => EndpointEvent::PeerDisconnected { link },
        };
        inner.handlers.dispatch(event);
        return;
    }
}
