//! conduit-mcp: session-oriented framework core for Model Context Protocol
//! servers.
//!
//! The crate implements the per-session protocol state machine of MCP
//! revision 2025-06-18 and the capability services that realize it: tools,
//! resources (with subscriptions), prompts, completion, logging, sampling,
//! elicitation, roots, and ping.
//!
//! # Architecture
//!
//! 1. **Protocol layer** (`protocol`) - JSON-RPC envelope, frame codec, and
//!    the MCP payload types
//! 2. **Session layer** (`session`, `registry`) - lifecycle state machine,
//!    request correlation, cancellation scopes, weak fan-out registries
//! 3. **Services layer** (`services`) - one service per capability
//! 4. **Server layer** (`server`) - dispatcher, initialization gating,
//!    capability advertisement
//! 5. **Transports** (`transport`, `auth`) - STDIO and Streamable HTTP with
//!    DNS-rebinding protection and optional OAuth protected-resource
//!    enforcement
//!
//! # Example
//!
//! ```no_run
//! use conduit_mcp::config::ServerConfig;
//! use conduit_mcp::server::McpServer;
//! use conduit_mcp::services::{ToolOutput, ToolSpec};
//! use conduit_mcp::transport::StdioTransport;
//!
//! # async fn run() -> conduit_mcp::Result<()> {
//! let server = McpServer::new(ServerConfig::new("adder", "1.0.0"));
//! server
//!     .tools()
//!     .register(ToolSpec::new(
//!         "add",
//!         "Add two integers",
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": {
//!                 "a": { "type": "integer" },
//!                 "b": { "type": "integer" }
//!             },
//!             "required": ["a", "b"]
//!         }),
//!         |args: serde_json::Map<String, serde_json::Value>| async move {
//!             let a = args["a"].as_i64().unwrap_or(0);
//!             let b = args["b"].as_i64().unwrap_or(0);
//!             Ok(ToolOutput::Json(serde_json::json!(a + b)))
//!         },
//!     ))
//!     .await?;
//!
//! server.run(StdioTransport::new()).await
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod pagination;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod services;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol revision this crate targets.
pub const PROTOCOL_VERSION: &str = protocol::LATEST_PROTOCOL_VERSION;
