//! Transport layer.
//!
//! A transport delivers and receives JSON-RPC frames for one session. Any
//! implementation of [`Transport`] can host a server; the crate ships STDIO
//! and Streamable HTTP.

pub mod http;
pub mod security;
pub mod stdio;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::Message;

pub use http::{serve_http, HttpServerConfig};
pub use security::SecurityPolicy;
pub use stdio::StdioTransport;

/// Contract for delivering and receiving frames with a session handle.
#[async_trait]
pub trait Transport: Send {
    /// Start the transport, returning the inbound stream and outbound sink.
    async fn start(&mut self) -> Result<(mpsc::Receiver<Message>, mpsc::Sender<Message>)>;

    /// Stop the transport.
    async fn stop(&mut self) -> Result<()>;
}
