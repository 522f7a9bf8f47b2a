//! In-process transport.
//!
//! A [`MemoryHub`] routes frames between any number of [`MemoryTransport`]s
//! living in the same process. Each endpoint gets its own transport from
//! [`MemoryHub::transport`]; the hub only holds routing state, so endpoints
//! stay independent of each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{
    EventSink, Link, LinkAttempt, LinkSignal, Transport, TransportError, TransportEvent,
};

/// One direction of an established connection.
#[derive(Debug)]
struct Route {
    /// Transport that may write on this side.
    owner: u64,
    /// Served name the connection was made to.
    service: String,
    /// Sink of the far side.
    deliver: EventSink,
    /// How the far side sees this connection.
    remote: Link,
    /// Attempt stream, present on the connecting side only.
    signals: Option<mpsc::UnboundedSender<LinkSignal>>,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: u64,
    sinks: HashMap<u64, EventSink>,
    servers: HashMap<String, u64>,
    routes: HashMap<u64, Route>,
}

impl HubState {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Remove a route and its partner, returning both.
    fn unlink(&mut self, link_id: u64) -> Option<(Route, Option<Route>)> {
        let route = self.routes.remove(&link_id)?;
        let partner = self.routes.remove(&route.remote.id());
        Some((route, partner))
    }
}

/// Shared router for in-process transports.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().expect("memory hub mutex poisoned")
    }

    /// Create a new transport routed through this hub.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        let id = self.lock().alloc();
        MemoryTransport {
            hub: self.clone(),
            id,
            served: Mutex::new(None),
        }
    }

    /// Returns true if some transport serves `name`.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn is_serving(&self, name: &str) -> bool {
        self.lock().servers.contains_key(name)
    }

    /// Number of live connections.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().routes.len() / 2
    }
}

/// One endpoint's view of a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
    served: Mutex<Option<String>>,
}

impl MemoryTransport {
    fn served(&self) -> MutexGuard<'_, Option<String>> {
        self.served.lock().expect("served name mutex poisoned")
    }

    /// Name this transport currently serves, if any.
    ///
    /// # Panics
    ///
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn served_name(&self) -> Option<String> {
        self.served().clone()
    }
}

/// Tell both sides that a connection went away.
fn notify_unlinked(route: &Route, partner: Option<&Route>, destroyed: bool) {
    let signal = if destroyed {
        LinkSignal::Destroyed
    } else {
        LinkSignal::Closed
    };
    for side in std::iter::once(route).chain(partner) {
        if let Some(signals) = &side.signals {
            let _ = signals.send(signal.clone());
        }
    }
    // Inbound sides hear about it as a transport event on their own sink,
    // which is the `deliver` of the opposite route.
    for (from, to) in [(Some(route), partner), (partner, Some(route))] {
        let (Some(from), Some(to)) = (from, to) else {
            continue;
        };
        if to.signals.is_none() {
            let link = from.remote.clone();
            let event = if destroyed {
                TransportEvent::Destroyed { link }
            } else {
                TransportEvent::Disconnected { link }
            };
            let _ = from.deliver.send(event);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn attach(&self, sink: EventSink) {
        self.hub.lock().sinks.insert(self.id, sink);
    }

    async fn serve(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        if !state.sinks.contains_key(&self.id) {
            return Err(TransportError::NotAttached);
        }
        match state.servers.get(name) {
            Some(&owner) if owner != self.id => {
                return Err(TransportError::AddressInUse(name.to_string()));
            }
            _ => {}
        }
        state.servers.insert(name.to_string(), self.id);
        drop(state);

        *self.served() = Some(name.to_string());
        tracing::debug!(name, "Memory transport serving");
        Ok(())
    }

    async fn connect_to(&self, peer: &str) -> Result<LinkAttempt, TransportError> {
        let (signals, attempt) = mpsc::unbounded_channel();
        let mut state = self.hub.lock();

        let own_sink = state
            .sinks
            .get(&self.id)
            .cloned()
            .ok_or(TransportError::NotAttached)?;
        let server_sink = state
            .servers
            .get(peer)
            .and_then(|server| state.sinks.get(server).map(|sink| (*server, sink.clone())));
        let Some((server_id, server_sink)) = server_sink else {
            drop(state);
            let _ = signals.send(LinkSignal::Refused(format!(
                "no endpoint is serving `{peer}`"
            )));
            return Ok(attempt);
        };

        let client_link = Link::new(state.alloc(), peer);
        let server_link = Link::new(state.alloc(), format!("inbound-{}", client_link.id()));
        state.routes.insert(
            client_link.id(),
            Route {
                owner: self.id,
                service: peer.to_string(),
                deliver: server_sink.clone(),
                remote: server_link.clone(),
                signals: Some(signals.clone()),
            },
        );
        state.routes.insert(
            server_link.id(),
            Route {
                owner: server_id,
                service: peer.to_string(),
                deliver: own_sink,
                remote: client_link.clone(),
                signals: None,
            },
        );
        drop(state);

        tracing::debug!(peer, link = %client_link, "Memory link established");
        let _ = server_sink.send(TransportEvent::Connected { link: server_link });
        let _ = signals.send(LinkSignal::Connected(client_link));
        Ok(attempt)
    }

    async fn write(&self, link: &Link, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.hub.lock();
        let route = state
            .routes
            .get(&link.id())
            .filter(|route| route.owner == self.id)
            .ok_or(TransportError::LinkClosed(link.id()))?;
        route
            .deliver
            .send(TransportEvent::Frame {
                link: route.remote.clone(),
                bytes: frame,
            })
            .map_err(|_| TransportError::LinkClosed(link.id()))
    }

    async fn disconnect(&self, peer: &str) {
        let mut state = self.hub.lock();
        let outgoing: Vec<u64> = state
            .routes
            .iter()
            .filter(|(_, route)| {
                route.owner == self.id && route.signals.is_some() && route.service == peer
            })
            .map(|(id, _)| *id)
            .collect();
        let unlinked: Vec<_> = outgoing
            .into_iter()
            .filter_map(|id| state.unlink(id))
            .collect();
        drop(state);

        for (route, partner) in &unlinked {
            notify_unlinked(route, partner.as_ref(), false);
        }
        tracing::debug!(peer, links = unlinked.len(), "Memory transport disconnected");
    }

    async fn stop(&self) {
        let served = self.served().take();
        let mut state = self.hub.lock();
        if let Some(name) = &served {
            if state.servers.get(name) == Some(&self.id) {
                state.servers.remove(name);
            }
        }

        let owned: Vec<u64> = state
            .routes
            .iter()
            .filter(|(_, route)| route.owner == self.id)
            .map(|(id, _)| *id)
            .collect();
        let unlinked: Vec<_> = owned
            .into_iter()
            .filter_map(|id| state.unlink(id))
            .collect();
        state.sinks.remove(&self.id);
        drop(state);

        for (route, partner) in &unlinked {
            // Links accepted by us are destroyed from the client's point of
            // view; links we opened are simply closed.
            let destroyed = route.signals.is_none();
            notify_unlinked(route, partner.as_ref(), destroyed);
        }
        tracing::debug!(served = ?served, links = unlinked.len(), "Memory transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(hub: &MemoryHub) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = hub.transport();
        let (sink, events) = mpsc::unbounded_channel();
        transport.attach(sink);
        (transport, events)
    }

    async fn connected(attempt: &mut LinkAttempt) -> Link {
        match attempt.recv().await {
            Some(LinkSignal::Connected(link)) => link,
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let hub = MemoryHub::new();
        let (server, mut server_events) = attached(&hub);
        let (client, mut client_events) = attached(&hub);
        server.serve("beta").await.unwrap();

        let mut attempt = client.connect_to("beta").await.unwrap();
        let client_link = connected(&mut attempt).await;
        assert_eq!(client_link.peer(), "beta");

        let Some(TransportEvent::Connected { link: server_link }) = server_events.recv().await
        else {
            panic!("expected inbound Connected");
        };

        client.write(&client_link, b"ping".to_vec()).await.unwrap();
        match server_events.recv().await {
            Some(TransportEvent::Frame { link, bytes }) => {
                assert_eq!(link, server_link);
                assert_eq!(bytes, b"ping");
            }
            other => panic!("expected Frame, got {other:?}"),
        }

        server.write(&server_link, b"pong".to_vec()).await.unwrap();
        match client_events.recv().await {
            Some(TransportEvent::Frame { link, bytes }) => {
                assert_eq!(link, client_link);
                assert_eq!(bytes, b"pong");
            }
            other => panic!("expected Frame, got {other:?}"),
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn connect_to_unknown_name_is_refused() {
        let hub = MemoryHub::new();
        let (client, _events) = attached(&hub);
        let mut attempt = client.connect_to("nobody").await.unwrap();
        assert!(matches!(attempt.recv().await, Some(LinkSignal::Refused(_))));
    }

    #[tokio::test]
    async fn unattached_transport_cannot_connect_or_serve() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        assert!(matches!(
            transport.connect_to("beta").await,
            Err(TransportError::NotAttached)
        ));
        assert!(matches!(
            transport.serve("beta").await,
            Err(TransportError::NotAttached)
        ));
    }

    #[tokio::test]
    async fn name_cannot_be_served_twice() {
        let hub = MemoryHub::new();
        let (first, _a) = attached(&hub);
        let (second, _b) = attached(&hub);
        first.serve("beta").await.unwrap();
        assert!(matches!(
            second.serve("beta").await,
            Err(TransportError::AddressInUse(name)) if name == "beta"
        ));
        assert!(hub.is_serving("beta"));
    }

    #[tokio::test]
    async fn foreign_link_cannot_be_written() {
        let hub = MemoryHub::new();
        let (server, _server_events) = attached(&hub);
        let (client, _client_events) = attached(&hub);
        let (stranger, _stranger_events) = attached(&hub);
        server.serve("beta").await.unwrap();

        let mut attempt = client.connect_to("beta").await.unwrap();
        let link = connected(&mut attempt).await;
        assert!(matches!(
            stranger.write(&link, b"x".to_vec()).await,
            Err(TransportError::LinkClosed(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_closes_attempt_and_notifies_server() {
        let hub = MemoryHub::new();
        let (server, mut server_events) = attached(&hub);
        let (client, _client_events) = attached(&hub);
        server.serve("beta").await.unwrap();

        let mut attempt = client.connect_to("beta").await.unwrap();
        let link = connected(&mut attempt).await;
        let _ = server_events.recv().await;

        client.disconnect("beta").await;
        assert_eq!(attempt.recv().await, Some(LinkSignal::Closed));
        assert!(matches!(
            server_events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        assert!(client.write(&link, b"x".to_vec()).await.is_err());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn stop_destroys_inbound_links() {
        let hub = MemoryHub::new();
        let (server, _server_events) = attached(&hub);
        let (client, _client_events) = attached(&hub);
        server.serve("beta").await.unwrap();
        assert_eq!(server.served_name().as_deref(), Some("beta"));

        let mut attempt = client.connect_to("beta").await.unwrap();
        let _link = connected(&mut attempt).await;

        server.stop().await;
        assert_eq!(attempt.recv().await, Some(LinkSignal::Destroyed));
        assert!(!hub.is_serving("beta"));
        assert!(server.served_name().is_none());
    }
}
