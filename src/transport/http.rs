//! Streamable HTTP transport.
//!
//! One endpoint serves the whole protocol: `POST` delivers a client frame
//! and returns the JSON response, `GET` opens the long-lived SSE stream for
//! server-initiated traffic, `DELETE` terminates the session. The first
//! successful `initialize` mints an opaque session id returned in the
//! `Mcp-Session-Id` header; every later exchange echoes it. A stateless
//! mode handles each `POST` as a complete session with no session table.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::stream;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{AuthDecision, AuthorizationManager};
use crate::error::Result;
use crate::protocol::types::{ClientCapabilities, Implementation};
use crate::protocol::{decode_frame, methods, JsonRpcResponse, Message, RequestId};
use crate::server::McpServer;
use crate::session::{PeerInfo, Session};
use crate::transport::security::SecurityPolicy;

/// Session id header, issued on `initialize` and echoed by the client.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
/// Negotiated protocol revision, mirrored on every post-initialize exchange.
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Configuration for [`serve_http`].
#[derive(Clone)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    /// Endpoint path.
    pub path: String,
    /// Handle each `POST` as a complete session, with no session table.
    pub stateless: bool,
    /// DNS-rebinding guard.
    pub security: SecurityPolicy,
    /// Optional bearer-token enforcement.
    pub authorization: Option<Arc<AuthorizationManager>>,
    /// Outbound buffer per session; a full buffer marks the session stale.
    pub channel_depth: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            path: "/mcp".to_string(),
            stateless: false,
            security: SecurityPolicy::default(),
            authorization: None,
            channel_depth: 64,
        }
    }
}

#[derive(Clone)]
struct HttpSessionHandle {
    session: Arc<Session>,
    /// Taken by the first `GET`; the SSE stream drains it.
    receiver: Arc<Mutex<Option<mpsc::Receiver<Message>>>>,
}

#[derive(Clone)]
struct HttpState {
    server: Arc<McpServer>,
    config: Arc<HttpServerConfig>,
    sessions: Arc<Mutex<HashMap<String, HttpSessionHandle>>>,
}

/// Build the axum router for an MCP endpoint.
pub fn router(server: Arc<McpServer>, config: HttpServerConfig) -> Router {
    let path = config.path.clone();
    let authorization = config.authorization.clone();
    let state = HttpState {
        server,
        config: Arc::new(config),
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    let mut app = Router::new().route(&path, any(endpoint));

    if let Some(manager) = authorization {
        let metadata_manager = manager.clone();
        app = app.route(
            manager.metadata_path(),
            get(move |headers: HeaderMap| async move {
                let resource = canonical_resource(&headers);
                metadata_manager.metadata_response(&resource)
            }),
        );
        app = app.layer(middleware::from_fn_with_state(manager, bearer_guard));
    }

    app.layer(middleware::from_fn_with_state(state.clone(), rebinding_guard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the endpoint until the process exits.
pub async fn serve_http(server: Arc<McpServer>, config: HttpServerConfig) -> Result<()> {
    server.tools().mark_started();
    let addr = format!("{}:{}", config.host, config.port);
    let path = config.path.clone();
    let app = router(server, config);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("serving Streamable HTTP at http://{addr}{path}");
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::Error::Transport(e.to_string()))?;
    Ok(())
}

// ===== Middleware =====

/// Reject requests whose Host/Origin fail the rebinding policy.
async fn rebinding_guard(
    State(state): State<HttpState>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());

    let policy = &state.config.security;
    if !policy.host_allowed(host) || !policy.origin_allowed(origin) {
        debug!(host, ?origin, "rejecting request failing rebinding guard");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "host or origin not allowed" })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Enforce bearer tokens on everything except the metadata document.
async fn bearer_guard(
    State(manager): State<Arc<AuthorizationManager>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == manager.metadata_path() {
        return next.run(request).await;
    }

    let resource = canonical_resource(request.headers());
    let metadata_url = format!("{resource}{}", manager.metadata_path());
    let authorization = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    match manager.authorize(authorization.as_deref(), &metadata_url).await {
        AuthDecision::Allow(context) => {
            let mut request = request;
            if let Some(context) = context {
                request.extensions_mut().insert(context);
            }
            next.run(request).await
        }
        AuthDecision::Deny(response) => response,
    }
}

fn canonical_resource(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(axum::http::header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

// ===== Endpoint =====

async fn endpoint(state: State<HttpState>, request: Request) -> Response {
    let method = request.method().clone();
    if method == axum::http::Method::POST {
        post_frame(state, request).await
    } else if method == axum::http::Method::GET {
        open_stream(state, request).await
    } else if method == axum::http::Method::DELETE {
        terminate_session(state, request).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn post_frame(State(state): State<HttpState>, request: Request) -> Response {
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let raw = String::from_utf8_lossy(&body);

    let message = match decode_frame(&raw) {
        Ok(message) => message,
        Err(e) => {
            let response = JsonRpcResponse::err(RequestId::Null, e.to_jsonrpc());
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    if state.config.stateless {
        return stateless_exchange(&state, message).await;
    }

    match message {
        Message::Request(req) if req.method == methods::INITIALIZE => {
            let (tx, rx) = mpsc::channel(state.config.channel_depth);
            let session_id = Uuid::new_v4().to_string();
            let session = Session::new(session_id.clone(), tx);

            let response = state.server.handle_request(&session, req).await;
            if response.error.is_some() {
                return (StatusCode::OK, Json(response)).into_response();
            }

            state.sessions.lock().await.insert(
                session_id.clone(),
                HttpSessionHandle {
                    session: session.clone(),
                    receiver: Arc::new(Mutex::new(Some(rx))),
                },
            );

            let mut response_headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                response_headers.insert(SESSION_ID_HEADER, value);
            }
            if let Some(version) = session.protocol_version().await {
                if let Ok(value) = HeaderValue::from_str(&version) {
                    response_headers.insert(PROTOCOL_VERSION_HEADER, value);
                }
            }
            (StatusCode::OK, response_headers, Json(response)).into_response()
        }
        message => {
            let Some(handle) = lookup_session(&state, &headers).await else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": "unknown or expired session" })),
                )
                    .into_response();
            };
            let session = handle.session;

            let mut response_headers = HeaderMap::new();
            if let Some(version) = session.protocol_version().await {
                if let Ok(value) = HeaderValue::from_str(&version) {
                    response_headers.insert(PROTOCOL_VERSION_HEADER, value);
                }
            }

            match message {
                Message::Request(req) => {
                    // The request runs in its own cancel scope so a
                    // notifications/cancelled on a parallel POST can stop it.
                    let id = req.id.clone();
                    let token = session.register_inflight(id.clone()).await;
                    let outcome = tokio::select! {
                        _ = token.cancelled() => None,
                        response = state.server.handle_request(&session, req) => Some(response),
                    };
                    session.finish_inflight(&id).await;

                    match outcome {
                        Some(response) => {
                            (StatusCode::OK, response_headers, Json(response)).into_response()
                        }
                        None => (StatusCode::ACCEPTED, response_headers).into_response(),
                    }
                }
                other => {
                    state.server.handle_message(&session, other).await;
                    (StatusCode::ACCEPTED, response_headers).into_response()
                }
            }
        }
    }
}

/// Stateless mode: a fresh ephemeral session per POST. `initialize` runs
/// normally; any other frame is handled against an implicitly ready
/// session, and everything is torn down afterwards.
async fn stateless_exchange(state: &HttpState, message: Message) -> Response {
    let (tx, _rx) = mpsc::channel(state.config.channel_depth);
    let session = Session::new(Uuid::new_v4().to_string(), tx);

    let is_initialize =
        matches!(&message, Message::Request(req) if req.method == methods::INITIALIZE);
    if !is_initialize {
        session
            .record_initialize(
                PeerInfo {
                    client_info: Implementation {
                        name: "stateless-client".to_string(),
                        version: String::new(),
                        title: None,
                    },
                    capabilities: ClientCapabilities::default(),
                    protocol_version: crate::protocol::LATEST_PROTOCOL_VERSION.to_string(),
                },
                RequestId::Null,
            )
            .await;
        session.mark_ready().await;
    }

    let response = state.server.handle_message(&session, message).await;
    state.server.release_session(&session).await;

    match response {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn open_stream(State(state): State<HttpState>, request: Request) -> Response {
    if state.config.stateless {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(handle) = lookup_session(&state, request.headers()).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown or expired session" })),
        )
            .into_response();
    };

    let Some(receiver) = handle.receiver.lock().await.take() else {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "stream already open" })),
        )
            .into_response();
    };

    let events = stream::unfold(receiver, |mut receiver| async move {
        let message = receiver.recv().await?;
        let event = match message.to_json() {
            Ok(json) => Event::default().event("message").data(json),
            Err(_) => return None,
        };
        Some((Ok::<Event, Infallible>(event), receiver))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn terminate_session(State(state): State<HttpState>, request: Request) -> Response {
    let Some(id) = session_id_from(request.headers()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let removed = state.sessions.lock().await.remove(&id);
    match removed {
        Some(handle) => {
            info!(session = %id, "terminating session");
            state.server.release_session(&handle.session).await;
            StatusCode::OK.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn lookup_session(state: &HttpState, headers: &HeaderMap) -> Option<HttpSessionHandle> {
    let id = session_id_from(headers)?;
    state.sessions.lock().await.get(&id).cloned()
}
