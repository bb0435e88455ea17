//! End-to-end lifecycle tests over an in-memory transport.
//!
//! A channel-backed transport stands in for stdio so the whole server loop
//! (framing aside) is exercised: handshake, gating, tool dispatch,
//! pagination, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use conduit_mcp::config::ServerConfig;
use conduit_mcp::error::Result;
use conduit_mcp::protocol::{JsonRpcRequest, JsonRpcNotification, Message, RequestId};
use conduit_mcp::server::McpServer;
use conduit_mcp::services::{ToolOutput, ToolSpec};
use conduit_mcp::transport::Transport;

/// In-memory transport: the test drives the client side of the channels.
struct ChannelTransport {
    incoming: Option<mpsc::Receiver<Message>>,
    outgoing: Option<mpsc::Sender<Message>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&mut self) -> Result<(mpsc::Receiver<Message>, mpsc::Sender<Message>)> {
        Ok((self.incoming.take().unwrap(), self.outgoing.take().unwrap()))
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

struct TestClient {
    to_server: mpsc::Sender<Message>,
    from_server: mpsc::Receiver<Message>,
    next_id: i64,
}

impl TestClient {
    fn start(server: Arc<McpServer>) -> Self {
        let (to_server, server_incoming) = mpsc::channel(64);
        let (server_outgoing, from_server) = mpsc::channel(64);
        let transport = ChannelTransport {
            incoming: Some(server_incoming),
            outgoing: Some(server_outgoing),
        };
        tokio::spawn(async move {
            let _ = server.run(transport).await;
        });
        Self {
            to_server,
            from_server,
            next_id: 0,
        }
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Value {
        self.next_id += 1;
        let id = RequestId::Number(self.next_id);
        self.to_server
            .send(Message::Request(JsonRpcRequest::new(
                id.clone(),
                method,
                params,
            )))
            .await
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(2), self.from_server.recv())
                .await
                .expect("timed out waiting for response")
                .expect("server hung up")
            {
                Message::Response(resp) if resp.id == id => {
                    return serde_json::to_value(resp).unwrap();
                }
                _ => continue,
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) {
        self.to_server
            .send(Message::Notification(JsonRpcNotification::new(
                method, params,
            )))
            .await
            .unwrap();
    }

    async fn initialize(&mut self) -> Value {
        let response = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": { "name": "test-client", "version": "1.0.0" }
                })),
            )
            .await;
        self.notify("notifications/initialized", None).await;
        response
    }
}

fn add_tool() -> ToolSpec {
    ToolSpec::new(
        "add",
        "Add two integers",
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "integer" }
            },
            "required": ["a", "b"]
        }),
        |args: serde_json::Map<String, Value>| async move {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(ToolOutput::Json(json!(a + b)))
        },
    )
}

#[tokio::test]
async fn test_tool_call_happy_path() {
    let server = McpServer::new(ServerConfig::new("adder", "1.0.0"));
    server.tools().register(add_tool()).await.unwrap();

    let mut client = TestClient::start(server);
    let init = client.initialize().await;
    assert_eq!(init["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(init["result"]["serverInfo"]["name"], "adder");

    let response = client
        .request(
            "tools/call",
            Some(json!({"name": "add", "arguments": {"a": 2, "b": 3}})),
        )
        .await;
    let result = &response["result"];
    assert_eq!(result["content"][0]["type"], "text");
    assert_eq!(result["content"][0]["text"], "5");
    assert_eq!(result["structuredContent"]["result"], 5);
    assert_eq!(result["isError"], false);
}

#[tokio::test]
async fn test_unknown_tool_is_invalid_params() {
    let server = McpServer::new(ServerConfig::new("adder", "1.0.0"));
    server.tools().register(add_tool()).await.unwrap();

    let mut client = TestClient::start(server);
    client.initialize().await;

    let response = client
        .request(
            "tools/call",
            Some(json!({"name": "missing", "arguments": {}})),
        )
        .await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("missing"));
}

#[tokio::test]
async fn test_requests_rejected_before_initialized() {
    let server = McpServer::new(ServerConfig::new("gated", "1.0.0"));
    let mut client = TestClient::start(server);

    let response = client.request("tools/list", None).await;
    assert_eq!(response["error"]["code"], -32002);

    let response = client.request("ping", None).await;
    assert!(response.get("error").is_none() || response["error"].is_null());
}

#[tokio::test]
async fn test_pagination_enumerates_each_tool_exactly_once() {
    let server = McpServer::new(ServerConfig::new("paged", "1.0.0").with_page_size(10));
    for i in 0..25 {
        server
            .tools()
            .register(ToolSpec::new(
                format!("t{i:02}"),
                "numbered",
                json!({"type": "object"}),
                |_: serde_json::Map<String, Value>| async { Ok(ToolOutput::None) },
            ))
            .await
            .unwrap();
    }

    let mut client = TestClient::start(server);
    client.initialize().await;

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let response = client.request("tools/list", params).await;
        let result = &response["result"];
        for tool in result["tools"].as_array().unwrap() {
            seen.push(tool["name"].as_str().unwrap().to_string());
        }
        match result["nextCursor"].as_str() {
            Some(next) => cursor = Some(next.to_string()),
            None => break,
        }
    }

    assert_eq!(seen.len(), 25);
    let mut deduped = seen.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), 25);

    // A cursor the server never produced is rejected.
    let response = client
        .request("tools/list", Some(json!({"cursor": "not-a-number"})))
        .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_cancellation_suppresses_response() {
    let server = McpServer::new(ServerConfig::new("cancel", "1.0.0"));
    server
        .tools()
        .register(ToolSpec::new(
            "slow",
            "Sleeps for a long time",
            json!({"type": "object"}),
            |_: serde_json::Map<String, Value>| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::Text("done".into()))
            },
        ))
        .await
        .unwrap();

    let mut client = TestClient::start(server);
    client.initialize().await;

    client
        .to_server
        .send(Message::Request(JsonRpcRequest::new(
            RequestId::Number(99),
            "tools/call",
            Some(json!({"name": "slow", "arguments": {}})),
        )))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    client
        .notify(
            "notifications/cancelled",
            Some(json!({"requestId": 99, "reason": "user"})),
        )
        .await;

    // No response may arrive for the cancelled id; certainly never two.
    let mut responses_for_99 = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(50), client.from_server.recv()).await {
            Ok(Some(Message::Response(resp))) if resp.id == RequestId::Number(99) => {
                responses_for_99 += 1;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(responses_for_99, 0);
}

#[tokio::test]
async fn test_logging_set_level_and_fanout() {
    let server = McpServer::new(ServerConfig::new("logs", "1.0.0"));
    let mut client = TestClient::start(server.clone());
    client.initialize().await;

    let response = client
        .request("logging/setLevel", Some(json!({"level": "warning"})))
        .await;
    assert!(response["error"].is_null());

    server
        .log_message(
            conduit_mcp::protocol::types::LoggingLevel::Error,
            json!({"message": "disk full"}),
            Some("storage"),
        )
        .await;
    server
        .log_message(
            conduit_mcp::protocol::types::LoggingLevel::Debug,
            json!({"message": "noise"}),
            None,
        )
        .await;

    let message = tokio::time::timeout(Duration::from_secs(1), client.from_server.recv())
        .await
        .unwrap()
        .unwrap();
    match message {
        Message::Notification(n) => {
            assert_eq!(n.method, "notifications/message");
            let params = n.params.unwrap();
            assert_eq!(params["level"], "error");
            assert_eq!(params["logger"], "storage");
        }
        other => panic!("expected notification, got {other:?}"),
    }
    // The debug record was below the session threshold.
    assert!(client.from_server.try_recv().is_err());
}
