//! Per-connection session state.
//!
//! A [`Session`] owns one side of a live JSON-RPC association: the lifecycle
//! state machine, the peer's negotiated capabilities, the pending-request
//! table for server-initiated requests, and the cancellation scopes of
//! inbound requests currently being handled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::types::{ClientCapabilities, Implementation, LoggingLevel};
use crate::protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
};

/// Opaque session identifier. Required by the Streamable HTTP transport,
/// synthesized for STDIO.
pub type SessionId = String;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No `initialize` seen yet.
    #[default]
    New,
    /// `initialize` answered; waiting for `notifications/initialized`.
    Negotiated,
    /// Fully operational.
    Ready,
    /// Transport gone; no further traffic.
    Closed,
}

/// What the peer told us during `initialize`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    pub protocol_version: String,
}

/// One live peer connection.
pub struct Session {
    id: SessionId,
    outgoing: mpsc::Sender<Message>,
    state: RwLock<SessionState>,
    peer: RwLock<Option<PeerInfo>>,
    log_threshold: RwLock<Option<LoggingLevel>>,
    /// Outbound server->client requests awaiting their response.
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    /// Inbound requests currently being handled, keyed by their cancel scope.
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
    /// The `initialize` request id; exempt from cancellation.
    init_request: Mutex<Option<RequestId>>,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, outgoing: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            outgoing,
            state: RwLock::new(SessionState::New),
            peer: RwLock::new(None),
            log_threshold: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            init_request: Mutex::new(None),
            next_id: AtomicI64::new(1),
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_ready(&self) -> bool {
        matches!(self.state().await, SessionState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the session closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    // ===== Lifecycle =====

    /// Record the outcome of a successful `initialize` exchange.
    pub async fn record_initialize(&self, peer: PeerInfo, request_id: RequestId) {
        *self.peer.write().await = Some(peer);
        *self.state.write().await = SessionState::Negotiated;
        *self.init_request.lock().await = Some(request_id);
    }

    /// Transition to `Ready` after `notifications/initialized`.
    pub async fn mark_ready(&self) {
        let mut state = self.state.write().await;
        if *state == SessionState::Negotiated {
            *state = SessionState::Ready;
        }
    }

    pub async fn peer(&self) -> Option<PeerInfo> {
        self.peer.read().await.clone()
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.peer
            .read()
            .await
            .as_ref()
            .map(|p| p.protocol_version.clone())
    }

    pub async fn supports_sampling(&self) -> bool {
        self.peer
            .read()
            .await
            .as_ref()
            .is_some_and(|p| p.capabilities.sampling.is_some())
    }

    pub async fn supports_elicitation(&self) -> bool {
        self.peer
            .read()
            .await
            .as_ref()
            .is_some_and(|p| p.capabilities.elicitation.is_some())
    }

    pub async fn supports_roots(&self) -> bool {
        self.peer
            .read()
            .await
            .as_ref()
            .is_some_and(|p| p.capabilities.roots.is_some())
    }

    pub async fn log_threshold(&self) -> Option<LoggingLevel> {
        *self.log_threshold.read().await
    }

    pub async fn set_log_threshold(&self, level: LoggingLevel) {
        *self.log_threshold.write().await = Some(level);
    }

    // ===== Outbound traffic =====

    /// Send a frame, waiting for buffer space. Used for responses and
    /// server-initiated requests, which must not be dropped.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.outgoing
            .send(message)
            .await
            .map_err(|_| Error::Transport("outbound channel closed".to_string()))
    }

    /// Send a notification without blocking on a slow consumer. A full
    /// buffer is reported as a transport error so callers can mark the
    /// session stale.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let notification = JsonRpcNotification::new(method, params);
        self.outgoing
            .try_send(Message::Notification(notification))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Transport("outbound buffer full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => Error::SessionClosed,
            })
    }

    /// Issue a request to the peer and await its response.
    ///
    /// Request IDs are allocated from a per-session counter so they are
    /// unique for this sender. Callers impose their own timeouts.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.send(Message::Request(request)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = tokio::select! {
            _ = self.closed.cancelled() => {
                self.pending.lock().await.remove(&id);
                return Err(Error::SessionClosed);
            }
            received = rx => received.map_err(|_| Error::SessionClosed)?,
        };

        match response.error {
            Some(err) => Err(rpc_error_to_error(err)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Route a response frame to the request that is waiting on it.
    /// Responses with no pending request are logged and dropped.
    pub async fn resolve_response(&self, response: JsonRpcResponse) {
        let waiter = self.pending.lock().await.remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                debug!(session = %self.id, id = %response.id, "response without pending request");
            }
        }
    }

    // ===== Inbound request tracking =====

    /// Register a cancel scope for an inbound request being handled.
    pub async fn register_inflight(&self, id: RequestId) -> CancellationToken {
        let token = self.closed.child_token();
        self.inflight.lock().await.insert(id, token.clone());
        token
    }

    /// Cancel the named inbound request. `initialize` is exempt; a request
    /// that already completed is silently ignored (the race is tolerated).
    pub async fn cancel_inflight(&self, id: &RequestId) {
        if self.init_request.lock().await.as_ref() == Some(id) {
            debug!(session = %self.id, "ignoring cancellation of initialize");
            return;
        }
        if let Some(token) = self.inflight.lock().await.get(id) {
            token.cancel();
        }
    }

    pub async fn finish_inflight(&self, id: &RequestId) {
        self.inflight.lock().await.remove(id);
    }

    // ===== Shutdown =====

    /// Close the session: fail all pending outbound requests, cancel every
    /// in-flight handler, and refuse further traffic.
    pub async fn close(&self) {
        *self.state.write().await = SessionState::Closed;
        self.closed.cancel();
        self.pending.lock().await.clear();
        self.inflight.lock().await.clear();
    }
}

fn rpc_error_to_error(err: JsonRpcError) -> Error {
    match err.code {
        crate::protocol::error_codes::METHOD_NOT_FOUND => Error::MethodNotFound(err.message),
        crate::protocol::error_codes::INVALID_PARAMS => Error::InvalidParams {
            message: err.message,
            data: err.data,
        },
        crate::protocol::error_codes::SERVICE_UNAVAILABLE => Error::ServiceUnavailable(err.message),
        _ => Error::Internal(err.message),
    }
}
