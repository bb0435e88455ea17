//! MCP protocol envelope and message codec.
//!
//! JSON-RPC 2.0 framing plus the method names and error codes defined by the
//! Model Context Protocol revision 2025-06-18.

pub mod types;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// JSON-RPC version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Latest protocol revision this crate implements.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol revisions accepted during negotiation, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the protocol version to answer an `initialize` request with.
///
/// The requested revision is echoed back when supported; anything else is
/// answered with the latest revision so the client can decide whether to
/// continue.
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

// ===== JSON-RPC Base Types =====

/// Request ID (string, number, or null for unparseable frames).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded wire frame.
#[derive(Debug, Clone)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Message {
    /// Serialize this frame to its wire representation.
    pub fn to_json(&self) -> Result<String> {
        let s = match self {
            Self::Request(r) => serde_json::to_string(r)?,
            Self::Response(r) => serde_json::to_string(r)?,
            Self::Notification(n) => serde_json::to_string(n)?,
        };
        Ok(s)
    }
}

/// Decode a single frame of UTF-8 JSON.
///
/// Enforces the envelope rules: `jsonrpc` must be `"2.0"`, a frame with both
/// `id` and `method` is a request, `method` alone is a notification, and `id`
/// with `result` or `error` is a response. Anything else is rejected with a
/// parse or invalid-request error.
pub fn decode_frame(raw: &str) -> Result<Message> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::Parse(format!("malformed JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidRequest("frame must be a JSON object".to_string()))?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(Error::InvalidRequest(
            "jsonrpc version must be \"2.0\"".to_string(),
        ));
    }

    let has_id = obj.contains_key("id");
    let has_method = obj.contains_key("method");

    match (has_id, has_method) {
        (true, true) => {
            let req: JsonRpcRequest = serde_json::from_value(value)
                .map_err(|e| Error::InvalidRequest(format!("malformed request: {e}")))?;
            Ok(Message::Request(req))
        }
        (false, true) => {
            let notif: JsonRpcNotification = serde_json::from_value(value)
                .map_err(|e| Error::InvalidRequest(format!("malformed notification: {e}")))?;
            Ok(Message::Notification(notif))
        }
        (true, false) => {
            if !obj.contains_key("result") && !obj.contains_key("error") {
                return Err(Error::InvalidRequest(
                    "response must carry result or error".to_string(),
                ));
            }
            let resp: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| Error::InvalidRequest(format!("malformed response: {e}")))?;
            Ok(Message::Response(resp))
        }
        (false, false) => Err(Error::InvalidRequest(
            "frame is neither request, response, nor notification".to_string(),
        )),
    }
}

// ===== Error Codes =====

/// JSON-RPC and MCP error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Resource not found / session not initialized (MCP-specific).
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
    /// Service unavailable (breaker open, timeout).
    pub const SERVICE_UNAVAILABLE: i32 = -32000;
}

// ===== Method Names =====

/// Method names defined by the protocol revision this crate targets.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";

    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";

    pub const COMPLETION_COMPLETE: &str = "completion/complete";

    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const LOGGING_MESSAGE: &str = "notifications/message";

    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ELICITATION_CREATE: &str = "elicitation/create";

    pub const ROOTS_LIST: &str = "roots/list";
    pub const ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";

    pub const PROGRESS: &str = "notifications/progress";
    pub const CANCELLED: &str = "notifications/cancelled";
}
