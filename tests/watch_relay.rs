//! Integration tests for the watch relay over HTTP
//!
//! Each test serves the control plane router on an ephemeral localhost
//! port and drives it with the same clients remote consumers use.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use minik8s::bus::{Bus, LocalBus, RemoteBus};
use minik8s::cache::{Informer, InformerConfig};
use minik8s::server::{create_router, AppState};
use minik8s::store::{ChangeEvent, EventKind, HttpStore, MemoryStore, StateStore};
use minik8s::watch::{
    HttpRegistrar, ListerWatcher, RegistrationError, RegistryConfig, WatchError, WatchRegistrar,
    WatchTicket, WatchedKey,
};

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

struct ControlPlane {
    base_url: String,
    state: AppState,
    store: MemoryStore,
}

async fn start_control_plane() -> ControlPlane {
    let port = find_available_port();
    let store = MemoryStore::new();
    let state = AppState::new(
        Arc::new(store.clone()),
        Arc::new(LocalBus::new()),
        RegistryConfig::default(),
    );
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind control plane");

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    sleep(Duration::from_millis(100)).await;

    ControlPlane {
        base_url: format!("http://127.0.0.1:{}", port),
        state,
        store,
    }
}

fn remote_lister(base_url: &str) -> ListerWatcher {
    ListerWatcher::new(
        Arc::new(HttpStore::new(base_url)),
        Arc::new(HttpRegistrar::new(base_url)),
        Arc::new(RemoteBus::new(base_url)),
    )
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event channel closed")
}

#[tokio::test]
async fn test_two_clients_share_one_store_watch() {
    let cp = start_control_plane().await;
    let a = HttpRegistrar::new(&cp.base_url);
    let b = HttpRegistrar::new(&cp.base_url);
    let pods = WatchedKey::collection("pod", "default");

    let t1 = a.register(&pods).await.unwrap();
    let t2 = b.register(&pods).await.unwrap();

    assert_ne!(t1, t2);
    assert_eq!(cp.store.active_watches_on("/registry/pod/default", true).await, 1);

    a.release(&pods, t1).await.unwrap();
    assert!(cp.state.registry.is_watching(&pods).await);
    assert_eq!(cp.store.active_watches().await, 1);

    b.release(&pods, t2).await.unwrap();
    assert!(!cp.state.registry.is_watching(&pods).await);
    assert_eq!(cp.store.active_watches().await, 0);

    // Idempotent
    a.release(&pods, t1).await.unwrap();
    a.release(&pods, WatchTicket(12345)).await.unwrap();
}

#[tokio::test]
async fn test_malformed_ticket_is_bad_request() {
    let cp = start_control_plane().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/watch/pod/default", cp.base_url))
        .form(&[("ticket", "not-a-number")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(cp.state.registry.entry_count().await, 0);
}

#[tokio::test]
async fn test_list_and_watch_over_http() {
    let cp = start_control_plane().await;
    let kv = HttpStore::new(&cp.base_url);
    kv.put("/registry/pod/default/existing", b"{\"image\":\"redis\"}".to_vec())
        .await
        .unwrap();

    let lister = remote_lister(&cp.base_url);
    let pods = WatchedKey::collection("pod", "default");

    let listed = lister.list(&pods).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "/registry/pod/default/existing");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = lister
        .watch_non_blocking(&pods, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

    kv.put("/registry/pod/default/web", b"{\"image\":\"nginx\"}".to_vec())
        .await
        .unwrap();
    kv.delete("/registry/pod/default/existing").await.unwrap();

    let put = recv(&mut rx).await;
    assert_eq!(put.kind, EventKind::Put);
    assert_eq!(put.key, "/registry/pod/default/web");
    assert_eq!(put.value, b"{\"image\":\"nginx\"}");

    let delete = recv(&mut rx).await;
    assert_eq!(delete.kind, EventKind::Delete);
    assert!(delete.revision > put.revision);

    handle.cancel().await.unwrap();
    assert_eq!(cp.state.registry.entry_count().await, 0);
    assert_eq!(cp.store.active_watches().await, 0);
}

#[tokio::test]
async fn test_failed_registration_leaves_no_subscription() {
    let cp = start_control_plane().await;
    cp.store.set_available(false).await;
    let lister = remote_lister(&cp.base_url);

    let result = lister
        .watch(
            &WatchedKey::collection("pod", "default"),
            |_| {},
            CancellationToken::new(),
        )
        .await;

    match result {
        Err(WatchError::Registration(RegistrationError::Rejected { status, .. })) => {
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("expected a rejected registration, got {:?}", other),
    }
    assert_eq!(cp.state.bus.topic_count(), 0);
    assert_eq!(cp.state.registry.entry_count().await, 0);
}

#[tokio::test]
async fn test_remote_bus_round_trip() {
    let cp = start_control_plane().await;
    let bus = RemoteBus::new(&cp.base_url);

    let mut sub = bus.subscribe("/registry/svc/default").await.unwrap();
    bus.publish("/registry/svc/default", b"hello".to_vec(), "text/plain")
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic, "/registry/svc/default");
    assert_eq!(msg.payload, b"hello");
    assert_eq!(msg.content_type, "text/plain");
}

#[derive(Debug, Clone, Deserialize)]
struct Pod {
    image: String,
}

#[tokio::test]
async fn test_informer_over_http() {
    let cp = start_control_plane().await;
    let kv = HttpStore::new(&cp.base_url);
    kv.put("/registry/pod/default/a", b"{\"image\":\"a:1\"}".to_vec())
        .await
        .unwrap();

    let informer: Informer<Pod> = Informer::new(
        remote_lister(&cp.base_url),
        WatchedKey::collection("pod", "default"),
        InformerConfig::default().with_retry_backoff(Duration::from_millis(50)),
    );
    let cache = informer.cache();
    let stop = CancellationToken::new();
    let task = tokio::spawn(informer.run(stop.clone()));

    timeout(Duration::from_secs(5), async {
        while cp.state.bus.subscriber_count("/registry/pod/default") == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        cache.get(&"/registry/pod/default/a".to_string()).unwrap().value.image,
        "a:1"
    );

    kv.put("/registry/pod/default/a", b"{\"image\":\"a:2\"}".to_vec())
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            let image = cache
                .get(&"/registry/pod/default/a".to_string())
                .map(|obj| obj.value.image);
            if image.as_deref() == Some("a:2") {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    stop.cancel();
    task.await.unwrap();
    assert_eq!(cp.state.registry.entry_count().await, 0);
}
