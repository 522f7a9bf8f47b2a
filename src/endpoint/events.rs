//! Endpoint events and typed handler registration.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::endpoint::{ChannelError, InboundMessage};
use crate::transport::Link;

/// Everything an endpoint reports to the application.
#[derive(Debug)]
pub enum EndpointEvent {
    /// The endpoint started serving under `name`.
    Started { name: String },
    /// The endpoint was destroyed.
    Stopped { name: String },
    /// A fresh request arrived.
    Message(InboundMessage),
    /// A transport or decoding failure not tied to a specific request.
    Error(ChannelError),
    /// A link came up.
    PeerConnected { link: Link },
    /// A link closed.
    PeerDisconnected { link: Link },
    /// A link was torn down by the far side.
    PeerDestroyed { link: Link },
}

/// Link state change reported to peer handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected,
    Destroyed,
}

type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&ChannelError) + Send + Sync>;
type PeerHandler = Arc<dyn Fn(PeerStatus, &Link) + Send + Sync>;
type EventHandler = Arc<dyn Fn(&EndpointEvent) + Send + Sync>;

#[derive(Default, Clone)]
struct HandlerSet {
    message: Vec<MessageHandler>,
    start: Vec<LifecycleHandler>,
    stop: Vec<LifecycleHandler>,
    error: Vec<ErrorHandler>,
    peer: Vec<PeerHandler>,
    any: Vec<EventHandler>,
}

/// Registered handlers, one list per event kind.
///
/// Dispatch works on a snapshot, so handlers may register further handlers
/// without deadlocking.
#[derive(Default)]
pub(crate) struct Handlers {
    set: RwLock<HandlerSet>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.read();
        f.debug_struct("Handlers")
            .field("message", &set.message.len())
            .field("start", &set.start.len())
            .field("stop", &set.stop.len())
            .field("error", &set.error.len())
            .field("peer", &set.peer.len())
            .field("any", &set.any.len())
            .finish()
    }
}

impl Handlers {
    fn read(&self) -> RwLockReadGuard<'_, HandlerSet> {
        self.set.read().expect("handler lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HandlerSet> {
        self.set.write().expect("handler lock poisoned")
    }

    pub(crate) fn add_message(&self, handler: MessageHandler) {
        self.write().message.push(handler);
    }

    pub(crate) fn add_start(&self, handler: LifecycleHandler) {
        self.write().start.push(handler);
    }

    pub(crate) fn add_stop(&self, handler: LifecycleHandler) {
        self.write().stop.push(handler);
    }

    pub(crate) fn add_error(&self, handler: ErrorHandler) {
        self.write().error.push(handler);
    }

    pub(crate) fn add_peer(&self, handler: PeerHandler) {
        self.write().peer.push(handler);
    }

    pub(crate) fn add_any(&self, handler: EventHandler) {
        self.write().any.push(handler);
    }

    /// Drop every registered handler.
    pub(crate) fn clear(&self) {
        *self.write() = HandlerSet::default();
    }

    /// Deliver an event to the catch-all handlers, then the typed ones.
    pub(crate) fn dispatch(&self, event: EndpointEvent) {
        let set = self.read().clone();

        for handler in &set.any {
            handler(&event);
        }

        match event {
            EndpointEvent::Started { name } => {
                for handler in &set.start {
                    handler(&name);
                }
            }
            EndpointEvent::Stopped { name } => {
                for handler in &set.stop {
                    handler(&name);
                }
            }
            EndpointEvent::Message(message) => {
                if set.message.is_empty() {
                    tracing::warn!(id = %message.id(), "No message handler registered, dropping request");
                }
                for handler in &set.message {
                    handler(message.clone());
                }
            }
            EndpointEvent::Error(error) => {
                for handler in &set.error {
                    handler(&error);
                }
            }
            EndpointEvent::PeerConnected { link } => notify_peer(&set, PeerStatus::Connected, &link),
            EndpointEvent::PeerDisconnected { link } => {
                notify_peer(&set, PeerStatus::Disconnected, &link);
            }
            EndpointEvent::PeerDestroyed { link } => notify_peer(&set, PeerStatus::Destroyed, &link),
        }
    }
}

fn notify_peer(set: &HandlerSet, status: PeerStatus, link: &Link) {
    for handler in &set.peer {
        handler(status, link);
    }
}
