//! Control plane HTTP API
//!
//! - Watch registration: `POST /watch/<kind>/<ns>[/<name>]`
//! - Bus bridge: `POST /bus/publish/<topic>`, `GET /bus/subscribe/<topic>` (WebSocket)
//! - Key-value access: `GET|PUT|DELETE /kv/<key>`
//! - Health and status

use axum::{
    body::Bytes,
    extract::{
        rejection::FormRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Form, Path, Query, State,
    },
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::bus::{Bus, BusFrame, BusMessage, Subscription};
use crate::server::state::AppState;
use crate::store::http::{DeleteResponse, PutResponse};
use crate::store::StoreError;
use crate::watch::{
    RegistryError, TicketResponse, WatchCommand, WatchReply, WatchTicket, WatchedKey,
};

/// Content type assumed for bus payloads published without one
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Create the control plane router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/watches", get(list_watches))
        // Watch registration
        .route("/watch/{*path}", post(watch_registration))
        // Bus bridge
        .route("/bus/publish/{*topic}", post(bus_publish))
        .route("/bus/subscribe/{*topic}", get(bus_subscribe))
        // Key-value access
        .route("/kv/{*key}", get(kv_get).put(kv_put).delete(kv_delete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let status = match e {
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
    };
    error_response(status, e.to_string())
}

// ============================================================================
// Health & Status
// ============================================================================

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "uptimeSecs")]
    uptime_secs: i64,
    watches: usize,
    topics: usize,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_secs(),
        watches: state.registry.entry_count().await,
        topics: state.bus.topic_count(),
    })
}

async fn list_watches(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.stats().await)
}

// ============================================================================
// Watch Registration
// ============================================================================

#[derive(Debug, Deserialize)]
struct TicketForm {
    ticket: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    #[serde(rename = "entryClosed")]
    pub entry_closed: bool,
}

/// Register when no `ticket` field is sent, release when one is
async fn watch_registration(
    State(state): State<AppState>,
    Path(path): Path<String>,
    form: Result<Form<TicketForm>, FormRejection>,
) -> Response {
    let Some(key) = WatchedKey::from_watch_path(&path) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("'{}' is not a <kind>/<namespace>[/<name>] path", path),
        );
    };

    let ticket = match form {
        Ok(Form(TicketForm { ticket: Some(raw) })) => match raw.trim().parse::<u64>() {
            Ok(n) => Some(WatchTicket(n)),
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, format!("malformed ticket '{}'", raw))
            }
        },
        Ok(Form(TicketForm { ticket: None })) => None,
        Err(FormRejection::InvalidFormContentType(_)) => None,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    let command = match ticket {
        Some(ticket) => WatchCommand::Release { key, ticket },
        None => WatchCommand::Register { key },
    };

    match state.registry.apply(command).await {
        Ok(WatchReply::Registered(ticket)) => {
            (StatusCode::OK, Json(TicketResponse { ticket })).into_response()
        }
        Ok(WatchReply::Released { entry_closed }) => {
            (StatusCode::OK, Json(ReleaseResponse { entry_closed })).into_response()
        }
        Err(RegistryError::Store(e)) => {
            warn!("Watch registration for {} failed: {}", path, e);
            store_error_response(e)
        }
    }
}

// ============================================================================
// Bus Bridge
// ============================================================================

fn rooted_path(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

async fn bus_publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let msg = BusMessage {
        topic: rooted_path(&topic),
        payload: body.to_vec(),
        content_type,
    };

    match state.bus.deliver(msg) {
        Ok(delivered) => (StatusCode::OK, Json(PublishResponse { delivered })).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn bus_subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Response {
    let topic = rooted_path(&topic);

    // Subscribe before the upgrade completes so nothing published after the
    // client sees the handshake is missed.
    match state.bus.subscribe(&topic).await {
        Ok(subscription) => ws.on_upgrade(move |socket| forward_subscription(socket, subscription)),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Stream bus messages to a WebSocket client as JSON frames
async fn forward_subscription(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let topic = subscription.topic().to_string();

    loop {
        tokio::select! {
            msg = subscription.next() => match msg {
                Some(msg) => {
                    let text = match serde_json::to_string(&BusFrame::from(&msg)) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode bus frame on {}: {}", topic, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Bus subscriber on {} disconnected", topic);
}

// ============================================================================
// Key-Value Access
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct KvQuery {
    #[serde(default)]
    prefix: bool,
}

async fn kv_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<KvQuery>,
) -> Response {
    let key = rooted_path(&key);

    if query.prefix {
        return match state.store.list(&key).await {
            Ok(listed) => (StatusCode::OK, Json(listed)).into_response(),
            Err(e) => store_error_response(e),
        };
    }

    match state.store.get(&key).await {
        Ok(Some(kv)) => (StatusCode::OK, Json(kv)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("key '{}' not found", key)),
        Err(e) => store_error_response(e),
    }
}

async fn kv_put(State(state): State<AppState>, Path(key): Path<String>, body: Bytes) -> Response {
    match state.store.put(&rooted_path(&key), body.to_vec()).await {
        Ok(revision) => (StatusCode::OK, Json(PutResponse { revision })).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn kv_delete(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.store.delete(&rooted_path(&key)).await {
        Ok(deleted) => (StatusCode::OK, Json(DeleteResponse { deleted })).into_response(),
        Err(e) => store_error_response(e),
    }
}
