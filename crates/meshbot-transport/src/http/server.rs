//! REST API over the [`ApiFacade`].
//!
//! | Route | Auth | Body |
//! |-------|------|------|
//! | `GET /health` | none | `{"ok": true}` |
//! | `GET /stats` | read | `{"data": StatsSnapshot}` |
//! | `GET /nodes` | read | `{"data": [node names]}` |
//! | `GET /user/{node_id}` | read | `{"data": StationInfo}` or 404 |
//! | `GET /history?conversation_id=` | read | `{"items", "meta"}` |
//! | `GET /history/channel/{ch}` | read | `{"items", "meta"}` |
//! | `GET /history/dm/{peer_id}` | read | `{"items", "meta"}` |
//! | `POST /send`, `/send/channel`, `/send/dm` | send | `SendResult` |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use meshbot_core::{
    BROADCAST_ID, ConversationId, Destination, Direction, HistoryPage, HistoryQuery,
    MAX_HISTORY_PAGE, OutboundMessage, SendResult, SortKey, SortOrder, TransportResult,
};
use meshbot_framework::{ApiFacade, ApiScope};

use super::auth::ApiToken;
use super::error::{ApiError, ApiResult};

/// Default page size of history routes.
const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Default number of name history rows on `/user`.
const DEFAULT_NAME_LIMIT: u32 = 50;

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub facade: ApiFacade,
    /// Token to scope. Empty closes every protected route.
    pub tokens: Arc<HashMap<String, ApiScope>>,
}

impl ApiState {
    pub fn new(facade: ApiFacade, tokens: HashMap<String, ApiScope>) -> Self {
        Self {
            facade,
            tokens: Arc::new(tokens),
        }
    }
}

/// Builds the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/nodes", get(nodes))
        .route("/user/{node_id}", get(user))
        .route("/history", get(history))
        .route("/history/channel/{channel}", get(history_channel))
        .route("/history/dm/{peer_id}", get(history_dm))
        .route("/send", post(send))
        .route("/send/channel", post(send_channel))
        .route("/send/dm", post(send_dm))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// A bound, not yet running API server.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Binds `addr` (for example `0.0.0.0:8080`).
    pub async fn bind(addr: &str, state: ApiState) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: router(state),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts serving on a background task.
    pub fn spawn(self) -> TransportResult<HttpServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(self.listener, self.router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "HTTP server error");
            }
        });

        info!(addr = %addr, "HTTP API listening");
        Ok(HttpServerHandle {
            addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a running API server.
pub struct HttpServerHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HttpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting requests and waits for in-flight ones.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "HTTP server task failed");
        }
        info!("HTTP API stopped");
    }
}

// =============================================================================
// Read handlers
// =============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn stats(_token: ApiToken, State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let snapshot = state.facade.get_stats().await?;
    Ok(Json(json!({ "data": snapshot })))
}

async fn nodes(_token: ApiToken, State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "data": state.facade.nodes() }))
}

#[derive(Debug, Default, Deserialize)]
struct UserParams {
    name_limit: Option<u32>,
    name_order: Option<String>,
}

async fn user(
    _token: ApiToken,
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Query(params): Query<UserParams>,
) -> ApiResult<Json<Value>> {
    let order = params
        .name_order
        .as_deref()
        .and_then(SortOrder::parse)
        .unwrap_or_default();
    let limit = params.name_limit.unwrap_or(DEFAULT_NAME_LIMIT);
    match state.facade.get_user_info(&node_id, limit, order).await? {
        Some(info) => Ok(Json(json!({ "data": info }))),
        None => Err(ApiError::NotFound),
    }
}

/// Paging parameters shared by the history routes. Unknown values fall back
/// to the defaults rather than failing the request.
#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    conversation_id: Option<String>,
    limit: Option<i64>,
    order: Option<String>,
    sort_by: Option<String>,
    before_id: Option<i64>,
    after_id: Option<i64>,
    direction: Option<String>,
}

impl HistoryParams {
    fn query(&self, conversation: ConversationId) -> HistoryQuery {
        let limit = self
            .limit
            .map(|l| l.clamp(1, i64::from(MAX_HISTORY_PAGE)) as u32)
            .unwrap_or(DEFAULT_HISTORY_LIMIT);
        HistoryQuery {
            conversation_id: conversation,
            limit,
            order: self
                .order
                .as_deref()
                .and_then(SortOrder::parse)
                .unwrap_or_default(),
            sort_by: self
                .sort_by
                .as_deref()
                .and_then(SortKey::parse)
                .unwrap_or_default(),
            before_id: self.before_id,
            after_id: self.after_id,
            direction: self.direction.as_deref().and_then(Direction::parse),
        }
    }
}

async fn history(
    _token: ApiToken,
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    let conversation = params
        .conversation_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("conversation_id is required"))?
        .parse::<ConversationId>()
        .map_err(ApiError::bad_request)?;
    read_history(&state, params.query(conversation)).await
}

async fn history_channel(
    _token: ApiToken,
    State(state): State<ApiState>,
    Path(channel): Path<u32>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    read_history(&state, params.query(ConversationId::Channel(channel))).await
}

async fn history_dm(
    _token: ApiToken,
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    let peer = peer_id.trim();
    if peer.is_empty() {
        return Err(ApiError::bad_request("peer_id must not be empty"));
    }
    read_history(&state, params.query(ConversationId::Direct(peer.to_string()))).await
}

async fn read_history(state: &ApiState, query: HistoryQuery) -> ApiResult<Json<Value>> {
    let page = state.facade.get_history(&query).await?;
    debug!(
        conversation = %query.conversation_id,
        items = page.items.len(),
        "History read"
    );
    Ok(Json(history_body(&query, page)))
}

/// `{items, meta}` with the query echoed and the next-page cursors.
fn history_body(query: &HistoryQuery, page: HistoryPage) -> Value {
    let conversation = match &query.conversation_id {
        ConversationId::Channel(ch) => json!({ "type": "channel", "channel": ch }),
        ConversationId::Direct(peer) => json!({ "type": "dm", "peer_id": peer }),
    };
    let sort_by = match query.sort_by {
        SortKey::Id => "id",
        SortKey::SentAt => "ts",
    };
    let direction = query.direction.map(|d| match d {
        Direction::In => "rx",
        Direction::Out => "tx",
    });
    json!({
        "items": page.items,
        "meta": {
            "conversation": conversation,
            "limit": query.effective_limit(),
            "order": query.order,
            "sort_by": sort_by,
            "direction": direction,
            "before_id": query.before_id,
            "after_id": query.after_id,
            "next_before_id": page.next_before_id,
            "next_after_id": page.next_after_id,
        }
    })
}

// =============================================================================
// Send handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct SendRequest {
    target: String,
    #[serde(default)]
    channel: u32,
    #[serde(alias = "payload")]
    text: String,
    #[serde(default)]
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendChannelRequest {
    channel: u32,
    #[serde(alias = "payload")]
    text: String,
    #[serde(default)]
    node: Option<String>,
    #[serde(default = "default_destination")]
    destination_id: String,
}

fn default_destination() -> String {
    BROADCAST_ID.to_string()
}

#[derive(Debug, Deserialize)]
struct SendDmRequest {
    user_id: String,
    #[serde(alias = "payload")]
    text: String,
    #[serde(default)]
    node: Option<String>,
}

async fn send(
    token: ApiToken,
    State(state): State<ApiState>,
    Json(req): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<SendResult>)> {
    let target = parse_target(&req.target, "target")?;
    dispatch_send(token, &state, target, req.channel, req.text, req.node).await
}

async fn send_channel(
    token: ApiToken,
    State(state): State<ApiState>,
    Json(req): Json<SendChannelRequest>,
) -> ApiResult<(StatusCode, Json<SendResult>)> {
    let target = parse_target(&req.destination_id, "destination_id")?;
    dispatch_send(token, &state, target, req.channel, req.text, req.node).await
}

async fn send_dm(
    token: ApiToken,
    State(state): State<ApiState>,
    Json(req): Json<SendDmRequest>,
) -> ApiResult<(StatusCode, Json<SendResult>)> {
    let target = parse_target(&req.user_id, "user_id")?;
    if target.is_broadcast() {
        return Err(ApiError::bad_request("user_id must name a node"));
    }
    dispatch_send(token, &state, target, 0, req.text, req.node).await
}

fn parse_target(raw: &str, field: &str) -> ApiResult<Destination> {
    if raw.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{field} must not be empty")));
    }
    Ok(Destination::parse(raw))
}

async fn dispatch_send(
    token: ApiToken,
    state: &ApiState,
    target: Destination,
    channel: u32,
    text: String,
    node: Option<String>,
) -> ApiResult<(StatusCode, Json<SendResult>)> {
    token.require_send()?;
    if text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let message = OutboundMessage {
        target,
        channel,
        text,
        node: node.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
    };
    let result = state.facade.send(message).await;
    let status = if result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshbot_core::{
        InboundEvent, RadioTransport, SendReceipt, SharedStore, TransportError,
    };
    use meshbot_framework::Dispatcher;
    use meshbot_store::{SqliteStore, StoreOptions};
    use reqwest::Client;

    struct TestRadio;

    #[async_trait]
    impl RadioTransport for TestRadio {
        fn name(&self) -> &str {
            "test"
        }

        async fn send(&self, message: &OutboundMessage) -> TransportResult<SendReceipt> {
            if message.text.contains("FAIL") {
                Err(TransportError::SendFailed("radio said no".into()))
            } else {
                Ok(SendReceipt::sent(Some("42".into())))
            }
        }

        fn nodes(&self) -> Vec<String> {
            vec!["roof".into()]
        }
    }

    struct TestApi {
        base: String,
        client: Client,
        dispatcher: Arc<Dispatcher>,
        handle: HttpServerHandle,
    }

    async fn start(tokens: &[(&str, ApiScope)]) -> TestApi {
        let store: SharedStore =
            Arc::new(SqliteStore::open_in_memory(StoreOptions::default()).unwrap());
        let dispatcher = Arc::new(Dispatcher::builder(store, Arc::new(TestRadio)).build());
        let tokens = tokens
            .iter()
            .map(|(t, s)| (t.to_string(), *s))
            .collect();
        let state = ApiState::new(ApiFacade::new(Arc::clone(&dispatcher)), tokens);
        let handle = HttpServer::bind("127.0.0.1:0", state)
            .await
            .unwrap()
            .spawn()
            .unwrap();
        TestApi {
            base: format!("http://{}", handle.local_addr()),
            client: Client::new(),
            dispatcher,
            handle,
        }
    }

    impl TestApi {
        async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
            let mut req = self.client.get(format!("{}{path}", self.base));
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await.unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap_or(Value::Null))
        }

        async fn post(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
            let resp = self
                .client
                .post(format!("{}{path}", self.base))
                .header("X-Api-Token", token)
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let api = start(&[]).await;
        let (status, body) = api.get("/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
        api.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_tokens_closes_protected_routes() {
        let api = start(&[]).await;
        let (status, body) = api.get("/stats", Some("anything")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "No API tokens configured");
        api.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_checks_and_scopes() {
        let api = start(&[("full", ApiScope::Send), ("ro", ApiScope::Read)]).await;

        assert_eq!(api.get("/stats", None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(api.get("/stats", Some("nope")).await.0, StatusCode::UNAUTHORIZED);

        let (status, body) = api.get("/stats", Some("ro")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["message_count"], 0);

        let (status, body) = api.get("/nodes", Some("ro")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!(["roof"]));

        let send = json!({ "channel": 0, "text": "hello" });
        assert_eq!(api.post("/send/channel", "ro", send.clone()).await.0, StatusCode::FORBIDDEN);

        let (status, body) = api.post("/send/channel", "full", send).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(body["parts"], 1);
        assert_eq!(body["message_id"], "42");

        api.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_routes() {
        let api = start(&[("t", ApiScope::Send)]).await;
        for text in ["one", "two", "three"] {
            api.dispatcher
                .submit(InboundEvent::text("!a1", 0, text))
                .await
                .unwrap();
        }
        let (status, _) = api
            .post("/send/dm", "t", json!({ "user_id": "!a1", "text": "psst" }))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = api.get("/history/channel/0?limit=2", Some("t")).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["body"], "three");
        assert_eq!(body["meta"]["conversation"], json!({ "type": "channel", "channel": 0 }));
        assert_eq!(body["meta"]["order"], "desc");
        assert_eq!(body["meta"]["next_before_id"], items[1]["id"]);

        let cursor = items[1]["id"].as_i64().unwrap();
        let (_, older) = api
            .get(&format!("/history/channel/0?before_id={cursor}"), Some("t"))
            .await;
        assert_eq!(older["items"][0]["body"], "one");

        let (status, body) = api.get("/history/dm/!a1?direction=tx", Some("t")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["body"], "psst");
        assert_eq!(body["meta"]["direction"], "tx");

        let (status, body) = api
            .get("/history?conversation_id=channel:0&order=asc&sort_by=ts", Some("t"))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["body"], "one");
        assert_eq!(body["meta"]["sort_by"], "ts");

        let (status, _) = api.get("/history?conversation_id=nope", Some("t")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = api.get("/history", Some("t")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        api.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let api = start(&[("t", ApiScope::Read)]).await;
        let (status, _) = api.get("/user/!ghost", Some("t")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        api.dispatcher
            .submit(InboundEvent::text("!a1", 0, "hi"))
            .await
            .unwrap();
        let (status, body) = api.get("/user/!a1?name_limit=5&name_order=asc", Some("t")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["node_id"], "!a1");

        api.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_validation_and_failure() {
        let api = start(&[("t", ApiScope::Send)]).await;

        let (status, _) = api
            .post("/send", "t", json!({ "target": "^all", "text": "   " }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = api
            .post("/send/dm", "t", json!({ "user_id": "^all", "text": "x" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = api
            .post("/send", "t", json!({ "target": "!b2", "channel": 1, "text": "FAIL now" }))
            .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["status"], "failed");
        assert!(body["error"].as_str().unwrap().contains("radio said no"));

        api.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_accepts_payload_field() {
        let api = start(&[("t", ApiScope::Send)]).await;

        let (status, body) = api
            .post("/send", "t", json!({ "target": "!a", "payload": "hi" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(body["parts"], 1);

        let (status, _) = api
            .post("/send/dm", "t", json!({ "user_id": "!a", "payload": "hi again" }))
            .await;
        assert_eq!(status, StatusCode::OK);

        api.handle.shutdown().await;
    }
}
