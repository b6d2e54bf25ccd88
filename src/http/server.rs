//! HTTP/WebSocket protocol server.
//!
//! # Responsibilities
//! - Create the Axum router (actions + WebSocket upgrade)
//! - Wire up middleware (tracing, timeout, request ID)
//! - Turn query string + JSON body into named action arguments
//! - Run every request through the host's dispatch pipeline
//!
//! # Design Decisions
//! - `ANY /{*action}`: the path names the action, e.g. `/Api/Info`
//! - Replies are always the encoded `{code, result}` envelope with 200;
//!   transport status codes only report malformed input

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::websocket;
use crate::lifecycle::Shutdown;
use crate::net::{factory, NetType, NetUri};
use crate::rpc::{
    ApiHandler, ApiServer, Args, Dispatcher, Encoder, HostCore, HostError, Message,
    ServerSettings, SessionInfo,
};

const DEFAULT_WS_PATH: &str = "/ws";

/// Application state injected into handlers.
#[derive(Clone)]
pub(crate) struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Shutdown,
    sequence: Arc<AtomicU32>,
    sessions: Arc<AtomicU32>,
}

impl HttpState {
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Id for a new WebSocket session; never 0.
    fn next_session_id(&self) -> u32 {
        loop {
            let id = self.sessions.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

struct Running {
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

/// Serves RPC over HTTP and WebSocket.
pub struct ApiHttpServer {
    name: String,
    local: RwLock<NetUri>,
    ws_path: String,
    request_timeout: Duration,
    encoder: RwLock<Option<Arc<dyn Encoder>>>,
    handler: RwLock<Option<Arc<dyn ApiHandler>>>,
    host: RwLock<Option<Arc<HostCore>>>,
    running: Mutex<Option<Running>>,
}

impl ApiHttpServer {
    pub fn new() -> Self {
        Self {
            name: "ApiHttp".to_string(),
            local: RwLock::new(NetUri::default().with_protocol(NetType::Http)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            request_timeout: ServerSettings::default().request_timeout,
            encoder: RwLock::new(None),
            handler: RwLock::new(None),
            host: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Path answering WebSocket upgrades.
    pub fn ws_path(&self) -> &str {
        &self.ws_path
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(&self, state: HttpState) -> Router {
        Router::new()
            .route(&self.ws_path, get(ws_handler))
            .route("/{*action}", any(action_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(self.request_timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }
}

impl Default for ApiHttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiServer for ApiHttpServer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn init(&mut self, uri: &NetUri, settings: &ServerSettings) -> bool {
        match uri.protocol {
            NetType::Http => self.name = "ApiHttp".to_string(),
            NetType::WebSocket => {
                self.name = "ApiWs".to_string();
                if !uri.path.is_empty() {
                    self.ws_path = uri.path.clone();
                }
            }
            _ => return false,
        }
        if !self.ws_path.starts_with('/') || self.ws_path.contains('{') {
            return false;
        }
        *self.local.write().expect("endpoint lock poisoned") = uri.clone();
        self.request_timeout = settings.request_timeout;
        true
    }

    fn encoder(&self) -> Option<Arc<dyn Encoder>> {
        self.encoder.read().expect("encoder lock poisoned").clone()
    }

    fn set_encoder(&self, encoder: Arc<dyn Encoder>) {
        *self.encoder.write().expect("encoder lock poisoned") = Some(encoder);
    }

    fn handler(&self) -> Option<Arc<dyn ApiHandler>> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    fn set_handler(&self, handler: Arc<dyn ApiHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    fn set_provider(&self, host: Arc<HostCore>) {
        *self.host.write().expect("host lock poisoned") = Some(host);
    }

    fn start(&self) -> Result<(), HostError> {
        let mut running = self.running.lock().expect("server state mutex poisoned");
        if running.is_some() {
            return Ok(());
        }

        let host = self
            .host
            .read()
            .expect("host lock poisoned")
            .clone()
            .ok_or_else(|| HostError::Init(self.name.clone()))?;
        let dispatcher = Arc::new(Dispatcher {
            encoder: self.encoder().unwrap_or_else(|| host.encoder()),
            handler: self.handler().unwrap_or_else(|| host.handler()),
            host,
        });

        let address = self.local.read().expect("endpoint lock poisoned").socket_addr();
        let listener = factory::bind_tcp(address)?;
        let bound = listener.local_addr()?;
        self.local.write().expect("endpoint lock poisoned").port = bound.port();

        let shutdown = Shutdown::new();
        let state = HttpState {
            dispatcher,
            shutdown: shutdown.clone(),
            sequence: Arc::new(AtomicU32::new(0)),
            sessions: Arc::new(AtomicU32::new(0)),
        };
        let app = self
            .build_router(state)
            .into_make_service_with_connect_info::<SocketAddr>();

        let mut stop = shutdown.subscribe();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(server = %name, error = %e, "HTTP server failed");
            }
        });

        tracing::info!(server = %self.name, address = %bound, ws_path = %self.ws_path, "HTTP server started");
        *running = Some(Running { shutdown, task });
        Ok(())
    }

    fn stop(&self, reason: &str) {
        let Some(running) = self.running.lock().expect("server state mutex poisoned").take() else {
            return;
        };
        running.shutdown.trigger();
        running.task.abort();
        tracing::info!(server = %self.name, reason, "HTTP server stopped");
    }

    fn is_active(&self) -> bool {
        self.running.lock().expect("server state mutex poisoned").is_some()
    }

    fn local(&self) -> NetUri {
        self.local.read().expect("endpoint lock poisoned").clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for ApiHttpServer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.shutdown.trigger();
                running.task.abort();
            }
        }
    }
}

/// Merge query pairs and a JSON object body into named arguments.
/// Body fields win over query fields.
fn collect_args(query: HashMap<String, String>, body: &[u8]) -> Result<Args, String> {
    let mut args: Args = query
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(args);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => {
            args.extend(fields);
            Ok(args)
        }
        Ok(_) => Err("request body must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON body: {}", e)),
    }
}

/// `ANY /{*action}`.
async fn action_handler(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let args = match collect_args(query, &body) {
        Ok(args) => args,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let dispatcher = &state.dispatcher;
    let payload = match dispatcher.encoder.encode_request(&action, &args) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, e.message).into_response(),
    };

    tracing::debug!(action = %action, remote = %remote, "HTTP call");

    let session = SessionInfo::new(0, Some(remote));
    let request = Message::request(state.next_sequence(), payload);
    match dispatcher.process(&session, request) {
        Some(reply) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply.payload,
        )
            .into_response(),
        None => (StatusCode::BAD_REQUEST, "request was not dispatched").into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let id = state.next_session_id();
    ws.on_upgrade(move |socket| websocket::serve(socket, state, id, remote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_fields_override_query() {
        let mut query = HashMap::new();
        query.insert("a".to_string(), "1".to_string());
        query.insert("b".to_string(), "x".to_string());
        let args = collect_args(query, br#"{"a": 2}"#).unwrap();
        assert_eq!(args["a"], json!(2));
        assert_eq!(args["b"], json!("x"));
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(collect_args(HashMap::new(), b"[1]").is_err());
        assert!(collect_args(HashMap::new(), b"{").is_err());
        assert!(collect_args(HashMap::new(), b"  ").unwrap().is_empty());
    }

    #[test]
    fn init_picks_ws_path() {
        let mut server = ApiHttpServer::new();
        let uri = NetUri::parse("ws://127.0.0.1:0/socket").unwrap();
        assert!(server.init(&uri, &ServerSettings::default()));
        assert_eq!(server.ws_path(), "/socket");
        assert_eq!(server.name(), "ApiWs");

        let tcp = NetUri::parse("tcp://127.0.0.1:0").unwrap();
        assert!(!ApiHttpServer::new().init(&tcp, &ServerSettings::default()));
    }

    #[tokio::test]
    async fn router_dispatches_path_as_action() {
        use axum::body::Body;
        use axum::extract::connect_info::MockConnectInfo;
        use axum::http::Request;
        use tower::ServiceExt;

        let host = Arc::new(HostCore::new("Router"));
        host.manager().register("Demo/Echo", |_, args| Ok(Value::Object(args)));
        let state = HttpState {
            dispatcher: Arc::new(host.dispatcher()),
            shutdown: Shutdown::new(),
            sequence: Arc::new(AtomicU32::new(0)),
            sessions: Arc::new(AtomicU32::new(0)),
        };
        let app = ApiHttpServer::new()
            .build_router(state)
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1234))));

        let response = app
            .oneshot(
                Request::post("/Demo/Echo?a=1")
                    .body(Body::from(r#"{"b": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply, serde_json::json!({"code": 0, "result": {"a": "1", "b": true}}));
    }
}
