//! Integration tests for endpoint teardown and link loss.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipc_courier::config::EndpointConfig;
use ipc_courier::endpoint::{ChannelEndpoint, ChannelError, EndpointEvent, PeerStatus};
use ipc_courier::pending::ReplyError;
use ipc_courier::transport::{MemoryHub, MemoryTransport};
use serde_json::json;

type Endpoint = ChannelEndpoint<MemoryTransport>;

async fn serving(hub: &MemoryHub, name: &str) -> Endpoint {
    let endpoint = ChannelEndpoint::new(EndpointConfig::new(name), hub.transport());
    endpoint.start().await.expect("Failed to start endpoint");
    endpoint
}

/// Poll `check` until it holds, failing the test after about a second.
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was never reached");
}

#[tokio::test]
async fn destroy_rejects_every_pending_request() {
    let hub = MemoryHub::new();
    let beta = serving(&hub, "beta").await;
    beta.on_message(|_| {});
    let alpha = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());

    let first = alpha.dispatch("beta", json!({}), None).await.unwrap();
    let second = alpha.dispatch("beta", json!({}), None).await.unwrap();
    assert_eq!(alpha.pending_count(), 2);

    alpha.destroy().await;

    for pending in [first, second] {
        let id = pending.id().to_string();
        let Err(ReplyError::Shutdown(reply)) = pending.await else {
            panic!("expected shutdown rejection");
        };
        assert_eq!(reply.id(), id);
        assert!(!reply.is_success());
        assert_eq!(reply.shutdown_reason(), Some("endpoint destroyed"));
    }
    assert_eq!(alpha.pending_count(), 0);
    assert!(alpha.known_peers().is_empty());
}

#[tokio::test]
async fn destroy_uses_configured_reason() {
    let hub = MemoryHub::new();
    let beta = serving(&hub, "beta").await;
    beta.on_message(|_| {});
    let config = EndpointConfig::new("alpha").with_shutdown_reason("going away");
    let alpha = ChannelEndpoint::new(config, hub.transport());

    let waiting = {
        let alpha = alpha.clone();
        tokio::spawn(async move { alpha.send("beta", json!({})).await })
    };
    eventually(|| alpha.pending_count() == 1).await;
    alpha.destroy().await;

    let err = waiting.await.unwrap().unwrap_err();
    let ChannelError::Reply(reply_err) = &err else {
        panic!("expected reply error, got {err:?}");
    };
    assert!(reply_err.is_shutdown());
    assert_eq!(
        err.reply().and_then(|r| r.shutdown_reason()),
        Some("going away")
    );
}

#[tokio::test]
async fn destroy_is_idempotent_and_terminal() {
    let hub = MemoryHub::new();
    let alpha = serving(&hub, "alpha").await;
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    alpha.on_stop(move |name| {
        assert_eq!(name, "alpha");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    alpha.destroy().await;
    alpha.destroy().await;

    assert!(alpha.is_destroyed());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(!hub.is_serving("alpha"));
    assert!(matches!(
        alpha.send("beta", json!({})).await,
        Err(ChannelError::Destroyed)
    ));
    assert!(matches!(alpha.start().await, Err(ChannelError::Destroyed)));
    assert!(matches!(
        alpha.connect_to("beta").await,
        Err(ChannelError::Destroyed)
    ));
}

#[tokio::test]
async fn destroy_releases_handlers() {
    let hub = MemoryHub::new();
    let alpha = serving(&hub, "alpha").await;
    let marker = Arc::new(());
    let held = Arc::clone(&marker);
    alpha.on_event(move |_| {
        let _ = &held;
    });
    assert_eq!(Arc::strong_count(&marker), 2);

    alpha.destroy().await;
    assert_eq!(Arc::strong_count(&marker), 1);
}

#[tokio::test]
async fn destroy_with_nothing_pending_still_releases_transport() {
    let hub = MemoryHub::new();
    let beta = serving(&hub, "beta").await;
    beta.on_message(|message| {
        tokio::spawn(async move { message.reply(json!({})).await.unwrap() });
    });
    let alpha = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());
    alpha.send("beta", json!({})).await.unwrap();
    assert_eq!(hub.connection_count(), 1);

    alpha.destroy().await;
    assert_eq!(hub.connection_count(), 0);
    assert!(hub.is_serving("beta"));
}

#[tokio::test]
async fn start_emits_started_and_claims_name() {
    let hub = MemoryHub::new();
    let alpha = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());
    let started = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&started);
    alpha.on_start(move |name| log.lock().unwrap().push(name.to_string()));

    alpha.start().await.unwrap();
    alpha.start().await.unwrap();

    assert_eq!(*started.lock().unwrap(), vec!["alpha".to_string()]);
    assert!(hub.is_serving("alpha"));

    let imposter = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());
    assert!(matches!(
        imposter.start().await,
        Err(ChannelError::Transport(_))
    ));
}

#[tokio::test]
async fn peer_destroyed_when_server_goes_away() {
    let hub = MemoryHub::new();
    let beta = serving(&hub, "beta").await;
    beta.on_message(|_| {});
    let alpha = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&statuses);
    alpha.on_peer(move |status, link| {
        log.lock().unwrap().push((status, link.peer().to_string()));
    });

    let pending = alpha.dispatch("beta", json!({}), None).await.unwrap();
    assert!(alpha.is_known("beta"));

    beta.destroy().await;
    eventually(|| !alpha.is_known("beta")).await;

    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            (PeerStatus::Connected, "beta".to_string()),
            (PeerStatus::Destroyed, "beta".to_string()),
        ]
    );
    // Link loss alone does not settle the request.
    assert_eq!(alpha.pending_ids(), vec![pending.id().to_string()]);
    assert!(alpha.cancel(pending.id()));
}

#[tokio::test]
async fn server_sees_client_disconnect() {
    let hub = MemoryHub::new();
    let beta = serving(&hub, "beta").await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    beta.on_event(move |event| {
        let label = match event {
            EndpointEvent::PeerConnected { .. } => "connected",
            EndpointEvent::PeerDisconnected { .. } => "disconnected",
            EndpointEvent::PeerDestroyed { .. } => "destroyed",
            _ => return,
        };
        log.lock().unwrap().push(label);
    });
    let alpha = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());

    alpha.connect_to("beta").await.unwrap();
    alpha.destroy().await;

    eventually(|| events.lock().unwrap().len() == 2).await;
    assert_eq!(*events.lock().unwrap(), vec!["connected", "disconnected"]);
}

#[tokio::test]
async fn reply_after_receiver_destroyed_fails() {
    let hub = MemoryHub::new();
    let beta = serving(&hub, "beta").await;
    let (tx, mut inbox) = tokio::sync::mpsc::unbounded_channel();
    beta.on_message(move |message| {
        let _ = tx.send(message);
    });
    let alpha = ChannelEndpoint::new(EndpointConfig::new("alpha"), hub.transport());

    let _pending = alpha.dispatch("beta", json!({}), None).await.unwrap();
    let message = inbox.recv().await.unwrap();
    beta.destroy().await;

    assert!(message.reply(json!({})).await.is_err());
}
