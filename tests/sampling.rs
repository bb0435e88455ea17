//! Sampling proxy behavior, breaker timing included.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use conduit_mcp::config::ServerConfig;
use conduit_mcp::error::Error;
use conduit_mcp::protocol::types::{
    ContentBlock, CreateMessageParams, Role, SamplingMessage,
};
use conduit_mcp::protocol::{JsonRpcRequest, JsonRpcResponse, Message, RequestId};
use conduit_mcp::server::McpServer;
use conduit_mcp::services::SamplingConfig;
use conduit_mcp::session::Session;

fn sampling_params() -> CreateMessageParams {
    CreateMessageParams {
        messages: vec![SamplingMessage {
            role: Role::User,
            content: ContentBlock::text("summarize this"),
        }],
        model_preferences: None,
        system_prompt: None,
        temperature: None,
        max_tokens: 64,
        stop_sequences: Vec::new(),
        metadata: None,
    }
}

/// A session whose client answers sampling requests only while `responsive`.
async fn sampling_session(
    server: &Arc<McpServer>,
    responsive: Arc<std::sync::atomic::AtomicBool>,
) -> (Arc<Session>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let session = Session::new("sampling", tx);

    server
        .handle_request(
            &session,
            JsonRpcRequest::new(
                RequestId::Number(1),
                "initialize",
                Some(json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": { "sampling": {} },
                    "clientInfo": { "name": "llm-client", "version": "0.1.0" }
                })),
            ),
        )
        .await;
    server
        .handle_notification(&session, "notifications/initialized", None)
        .await;

    let responder_session = session.clone();
    let responder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Message::Request(req) = message {
                if req.method == "sampling/createMessage"
                    && responsive.load(std::sync::atomic::Ordering::SeqCst)
                {
                    responder_session
                        .resolve_response(JsonRpcResponse::ok(
                            req.id,
                            json!({
                                "role": "assistant",
                                "content": {"type": "text", "text": "summary"},
                                "model": "demo-model",
                                "stopReason": "endTurn"
                            }),
                        ))
                        .await;
                }
                // Unresponsive: swallow the request so the call times out.
            }
        }
    });

    (session, responder)
}

fn breaker_server() -> Arc<McpServer> {
    McpServer::new(
        ServerConfig::new("sampler", "1.0.0").with_sampling(SamplingConfig {
            concurrency: 4,
            failure_threshold: 3,
            cooldown: Duration::from_millis(80),
            timeout: Duration::from_millis(30),
        }),
    )
}

#[tokio::test]
async fn test_roundtrip_returns_client_result_unchanged() {
    let server = breaker_server();
    let responsive = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let (session, responder) = sampling_session(&server, responsive).await;

    let result = server
        .request_sampling(&session, sampling_params())
        .await
        .unwrap();
    assert_eq!(result.model, "demo-model");
    assert_eq!(result.stop_reason.as_deref(), Some("endTurn"));

    responder.abort();
}

#[tokio::test]
async fn test_breaker_opens_then_recovers() {
    let server = breaker_server();
    let responsive = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let (session, responder) = sampling_session(&server, responsive.clone()).await;

    // Three consecutive timeouts trip the breaker.
    for _ in 0..3 {
        let err = server
            .request_sampling(&session, sampling_params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    // Inside the cooldown window calls fail immediately.
    let before = std::time::Instant::now();
    let err = server
        .request_sampling(&session, sampling_params())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable(_)));
    assert_eq!(err.jsonrpc_code(), -32000);
    assert!(before.elapsed() < Duration::from_millis(20));

    // After the cooldown the half-open probe is dispatched; success closes
    // the breaker again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    responsive.store(true, std::sync::atomic::Ordering::SeqCst);

    let result = server
        .request_sampling(&session, sampling_params())
        .await
        .unwrap();
    assert_eq!(result.model, "demo-model");

    // And the next call goes straight through.
    let result = server
        .request_sampling(&session, sampling_params())
        .await
        .unwrap();
    assert_eq!(result.model, "demo-model");

    responder.abort();
}

#[tokio::test]
async fn test_client_without_sampling_capability() {
    let server = breaker_server();
    let (tx, _rx) = mpsc::channel::<Message>(8);
    let session = Session::new("plain", tx);

    server
        .handle_request(
            &session,
            JsonRpcRequest::new(
                RequestId::Number(1),
                "initialize",
                Some(json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": { "name": "no-llm", "version": "0.1.0" }
                })),
            ),
        )
        .await;
    server
        .handle_notification(&session, "notifications/initialized", None)
        .await;

    let err = server
        .request_sampling(&session, sampling_params())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MethodNotFound(_)));
}
