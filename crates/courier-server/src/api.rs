use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderValue, Method},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use courier_shared::{Message, MessageId, SendRequest, UserId};
use courier_store::MessageStore;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{HubHandle, HubStats};
use crate::session;
use crate::transport::split_websocket;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    /// Read-only queries go straight to the store.
    pub store: Arc<dyn MessageStore>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origin);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_connect))
        .route("/messages", post(send_message))
        .route("/api/conversation/:user1/:user2", get(conversation))
        .route("/api/unread-senders", get(unread_senders))
        .route("/api/online/:user_id", get(online))
        .route("/api/stats", get(hub_stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if allowed_origin == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any);
    }

    match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .expose_headers([header::CONTENT_LENGTH])
            .allow_credentials(true),
        Err(_) => {
            warn!(origin = %allowed_origin, "Invalid ALLOWED_ORIGIN, allowing any origin");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(methods)
                .allow_headers(Any)
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct SendMessageResponse {
    status: &'static str,
    id: MessageId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadSendersResponse {
    sender_ids: Vec<UserId>,
}

#[derive(Serialize)]
struct OnlineResponse {
    user_id: UserId,
    online: bool,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

fn parse_user_id(raw: Option<&str>) -> Result<UserId, ServerError> {
    let raw = raw.ok_or_else(|| ServerError::BadRequest("user_id is required".to_string()))?;
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("Invalid user id: {raw}")))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ws?user_id=N
///
/// The caller is trusted to have authenticated `user_id` at the edge. An
/// invalid id is rejected before the upgrade.
async fn ws_connect(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let user_id = parse_user_id(query.user_id.as_deref())?;
    let hub = state.hub.clone();
    let config = state.config.session_config();

    info!(user_id = %user_id, "WebSocket connection accepted");
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split_websocket(socket);
        session::run(user_id, sink, stream, hub, config).await;
    }))
}

/// POST /messages
///
/// Same durability and delivery path as a message sent over a socket.
async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendMessageResponse>, ServerError> {
    let message = request.stamp();
    state.hub.route(&message).await?;

    Ok(Json(SendMessageResponse {
        status: "message sent",
        id: message.id,
    }))
}

async fn conversation(
    State(state): State<AppState>,
    Path((user1, user2)): Path<(String, String)>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let a = parse_user_id(Some(&user1))?;
    let b = parse_user_id(Some(&user2))?;
    Ok(Json(state.store.fetch_conversation(a, b).await?))
}

async fn unread_senders(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UnreadSendersResponse>, ServerError> {
    let receiver = parse_user_id(query.user_id.as_deref())?;
    let senders = state.store.list_unread_sender_ids(receiver).await?;
    Ok(Json(UnreadSendersResponse {
        sender_ids: senders.into_iter().collect(),
    }))
}

async fn online(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<OnlineResponse>, ServerError> {
    let user_id = parse_user_id(Some(&user_id))?;
    let online = state.hub.is_online(user_id).await?;
    Ok(Json(OnlineResponse { user_id, online }))
}

async fn hub_stats(State(state): State<AppState>) -> Result<Json<HubStats>, ServerError> {
    Ok(Json(state.hub.stats().await?))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    use courier_store::{MemoryStore, StoreOp};

    use super::*;
    use crate::hub::{spawn_hub, HubConfig};

    fn app_state(store: &MemoryStore) -> AppState {
        let store: Arc<dyn MessageStore> = Arc::new(store.clone());
        let (hub, _task) = spawn_hub(store.clone(), HubConfig::default());
        AppState {
            hub,
            store,
            config: Arc::new(ServerConfig::default()),
        }
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_message(sender: u64, receiver: u64, content: &str) -> Request<Body> {
        let body = serde_json::json!({
            "sender_id": sender,
            "receiver_id": receiver,
            "content": content,
        });
        Request::builder()
            .method("POST")
            .uri("/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    async fn wait_online(state: &AppState, user: u64) {
        while !state.hub.is_online(UserId(user)).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_health() {
        let state = app_state(&MemoryStore::new());
        let (status, body) = call(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_send_message_to_offline_user() {
        let store = MemoryStore::new();
        let state = app_state(&store);

        let (status, body) = call(&state, post_message(7, 9, "hi")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "message sent");
        let unread = store.fetch_unread(UserId(9)).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(body["id"], unread[0].id.to_string());
        assert!(!unread[0].read);
    }

    #[tokio::test]
    async fn test_send_message_store_failure() {
        let store = MemoryStore::new();
        store.set_failing(StoreOp::Save, true);
        let state = app_state(&store);

        let (status, body) = call(&state, post_message(7, 9, "hi")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Storage error");
    }

    #[tokio::test]
    async fn test_unread_senders() {
        let store = MemoryStore::new();
        let state = app_state(&store);

        let (_, body) = call(&state, get("/api/unread-senders?user_id=9")).await;
        assert_eq!(body["senderIds"], serde_json::json!([]));

        call(&state, post_message(8, 9, "a")).await;
        call(&state, post_message(7, 9, "b")).await;
        call(&state, post_message(7, 9, "c")).await;

        let (status, body) = call(&state, get("/api/unread-senders?user_id=9")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["senderIds"], serde_json::json!([7, 8]));

        let (status, _) = call(&state, get("/api/unread-senders")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_conversation() {
        let store = MemoryStore::new();
        for (from, to, content, ts) in [(9, 7, "second", 2), (7, 9, "first", 1), (7, 3, "other", 0)] {
            store
                .save(&Message::stamped_at(UserId(from), UserId(to), content, ts))
                .await
                .unwrap();
        }
        let state = app_state(&store);

        let (status, body) = call(&state, get("/api/conversation/7/9")).await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);

        let (status, body) = call(&state, get("/api/conversation/seven/9")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("seven"));
    }

    #[tokio::test]
    async fn test_online() {
        let state = app_state(&MemoryStore::new());
        let (status, body) = call(&state, get("/api/online/9")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"user_id": 9, "online": false}));
    }

    #[tokio::test]
    async fn test_stats_after_send() {
        let store = MemoryStore::new();
        let state = app_state(&store);
        call(&state, post_message(7, 9, "hi")).await;

        let (status, body) = call(&state, get("/api/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online"], 0);
        assert_eq!(body["evictions"], 0);
    }

    #[tokio::test]
    async fn test_cors_exact_origin() {
        let mut state = app_state(&MemoryStore::new());
        state.config = Arc::new(ServerConfig {
            allowed_origin: "https://chat.example".to_string(),
            ..ServerConfig::default()
        });

        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://chat.example")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();

        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://chat.example"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn test_offline_message_delivered_on_connect() {
        let store = MemoryStore::new();
        let state = app_state(&store);
        let addr = spawn_server(state.clone()).await;

        let (status, _) = call(&state, post_message(7, 9, "hi")).await;
        assert_eq!(status, StatusCode::OK);

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id=9"))
            .await
            .unwrap();

        let frame = socket.next().await.unwrap().unwrap();
        let tungstenite::Message::Text(text) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let received: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(received.sender_id, UserId(7));
        assert_eq!(received.receiver_id, UserId(9));
        assert_eq!(received.content, "hi");
        assert!(received.read);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (_, body) = call(&state, get("/api/unread-senders?user_id=9")).await;
                if body["senderIds"] == serde_json::json!([]) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_live_chat_over_websockets() {
        let state = app_state(&MemoryStore::new());
        let addr = spawn_server(state.clone()).await;

        let (mut seven, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id=7"))
            .await
            .unwrap();
        let (mut nine, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id=9"))
            .await
            .unwrap();
        wait_online(&state, 7).await;
        wait_online(&state, 9).await;

        seven
            .send(tungstenite::Message::Text(
                r#"{"receiver_id":9,"content":"hello nine"}"#.to_string(),
            ))
            .await
            .unwrap();

        let Some(Ok(tungstenite::Message::Text(text))) = nine.next().await else {
            panic!("nine did not receive the message");
        };
        let received: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(received.sender_id, UserId(7));
        assert_eq!(received.content, "hello nine");

        let Some(Ok(tungstenite::Message::Text(echo))) = seven.next().await else {
            panic!("seven did not receive the echo");
        };
        let echo: Message = serde_json::from_str(&echo).unwrap();
        assert_eq!(echo.id, received.id);
    }

    #[tokio::test]
    async fn test_ws_rejects_invalid_user_id() {
        let state = app_state(&MemoryStore::new());
        let addr = spawn_server(state).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id=abc"))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 400),
            other => panic!("unexpected error: {other}"),
        }
    }
}
