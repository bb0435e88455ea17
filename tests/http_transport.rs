//! Streamable HTTP transport tests, driven through the router directly.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use conduit_mcp::auth::{
    AuthContext, AuthError, AuthorizationConfig, AuthorizationManager, AuthorizationProvider,
};
use conduit_mcp::config::ServerConfig;
use conduit_mcp::server::McpServer;
use conduit_mcp::services::{ToolOutput, ToolSpec};
use conduit_mcp::transport::http::{
    router, HttpServerConfig, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
};

fn demo_server() -> Arc<McpServer> {
    let server = McpServer::new(ServerConfig::new("http-demo", "1.0.0"));
    server
}

async fn register_echo(server: &Arc<McpServer>) {
    server
        .tools()
        .register(ToolSpec::new(
            "echo",
            "Echo the input",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args: serde_json::Map<String, Value>| async move {
                Ok(ToolOutput::Text(
                    args.get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ))
            },
        ))
        .await
        .unwrap();
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::HOST, "127.0.0.1:8000")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn initialize_frame(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": { "name": "http-client", "version": "0.1.0" }
        }
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_initialize_issues_session_id() {
    let app = router(demo_server(), HttpServerConfig::default());

    let response = app.oneshot(post("/mcp", initialize_frame(1))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!session_id.is_empty());
    assert_eq!(
        response.headers().get(PROTOCOL_VERSION_HEADER).unwrap(),
        "2025-06-18"
    );

    let body = body_json(response).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(body["result"]["serverInfo"]["name"], "http-demo");
}

#[tokio::test]
async fn test_session_flow_over_http() {
    let server = demo_server();
    register_echo(&server).await;
    let app = router(server, HttpServerConfig::default());

    let response = app
        .clone()
        .oneshot(post("/mcp", initialize_frame(1)))
        .await
        .unwrap();
    let session_id = response
        .headers()
        .get(SESSION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // notifications/initialized gets 202 and unlocks the session.
    let mut request = post(
        "/mcp",
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    );
    request
        .headers_mut()
        .insert(SESSION_ID_HEADER, session_id.parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut request = post(
        "/mcp",
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hello"}}
        }),
    );
    request
        .headers_mut()
        .insert(SESSION_ID_HEADER, session_id.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(PROTOCOL_VERSION_HEADER).unwrap(),
        "2025-06-18"
    );

    let body = body_json(response).await;
    assert_eq!(body["result"]["content"][0]["text"], "hello");
}

#[tokio::test]
async fn test_request_without_session_is_not_found() {
    let app = router(demo_server(), HttpServerConfig::default());

    let response = app
        .oneshot(post(
            "/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_frame_is_bad_request() {
    let app = router(demo_server(), HttpServerConfig::default());

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::HOST, "127.0.0.1:8000")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn test_rebinding_guard_rejects_foreign_host() {
    let app = router(demo_server(), HttpServerConfig::default());

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::HOST, "evil.example.com:8000")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(initialize_frame(1).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_rebinding_guard_rejects_foreign_origin() {
    let app = router(demo_server(), HttpServerConfig::default());

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::HOST, "127.0.0.1:8000")
        .header(header::ORIGIN, "https://evil.example.com")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(initialize_frame(1).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_stateless_mode_round_trip() {
    let server = demo_server();
    register_echo(&server).await;
    let app = router(
        server,
        HttpServerConfig {
            stateless: true,
            ..Default::default()
        },
    );

    // No handshake, no session header: each POST stands alone.
    let response = app
        .oneshot(post(
            "/mcp",
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "one-shot"}}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["result"]["content"][0]["text"], "one-shot");
}

// ===== Authorization =====

struct TokenProvider;

#[async_trait::async_trait]
impl AuthorizationProvider for TokenProvider {
    async fn validate(&self, token: &str) -> Result<AuthContext, AuthError> {
        if token == "secret" {
            Ok(AuthContext {
                subject: Some("tester".into()),
                scopes: vec!["mcp:use".into()],
                claims: json!({}),
            })
        } else {
            Err(AuthError::InvalidToken("unknown token".into()))
        }
    }
}

fn authorized_config() -> HttpServerConfig {
    let manager = AuthorizationManager::new(
        AuthorizationConfig {
            authorization_servers: vec!["https://as.example.com".into()],
            required_scopes: vec!["mcp:use".into()],
            ..Default::default()
        },
        Arc::new(TokenProvider),
    );
    HttpServerConfig {
        authorization: Some(Arc::new(manager)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_missing_token_yields_401_with_challenge() {
    let app = router(demo_server(), authorized_config());

    let response = app.oneshot(post("/mcp", initialize_frame(1))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.contains("resource_metadata="));
    assert!(challenge.contains("/.well-known/oauth-protected-resource"));
}

#[tokio::test]
async fn test_valid_token_passes_through() {
    let app = router(demo_server(), authorized_config());

    let mut request = post("/mcp", initialize_frame(1));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer secret".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metadata_document_served_with_cache_control() {
    let app = router(demo_server(), authorized_config());

    let request = Request::builder()
        .method("GET")
        .uri("/.well-known/oauth-protected-resource")
        .header(header::HOST, "127.0.0.1:8000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cache = response
        .headers()
        .get(header::CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cache.contains("max-age=300"));

    let body = body_json(response).await;
    assert_eq!(body["resource"], "http://127.0.0.1:8000");
    assert_eq!(body["authorization_servers"][0], "https://as.example.com");
}
