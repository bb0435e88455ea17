//! MCP server: dispatcher and session lifecycle.
//!
//! [`McpServer`] owns one instance of every capability service and maps
//! method names onto them. It enforces the initialize handshake (all
//! non-lifecycle requests are rejected until `notifications/initialized`),
//! direction (client-side methods are unknown on the server), and
//! cancellation (each inbound request runs inside its own cancel scope).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::types::{
    CallToolParams, CancelledParams, CompleteParams, CreateMessageParams, CreateMessageResult,
    ElicitParams, ElicitResult, Implementation, InitializeParams, InitializeResult,
    ListRootsResult, LoggingLevel, PaginatedParams, PromptsCapability, ResourcesCapability,
    ServerCapabilities, SetLevelParams, ToolsCapability, CompletionsCapability, LoggingCapability,
};
use crate::protocol::{methods, JsonRpcRequest, JsonRpcResponse, Message};
use crate::services::{
    CompletionService, ElicitationService, LoggingService, PingService, PromptsService,
    ResourcesService, RootGuard, RootsService, SamplingService, ToolsService,
};
use crate::session::{PeerInfo, Session, SessionState};
use crate::transport::Transport;

/// The per-session protocol state machine and its capability services.
pub struct McpServer {
    config: ServerConfig,
    tools: ToolsService,
    resources: ResourcesService,
    prompts: PromptsService,
    completions: CompletionService,
    logging: LoggingService,
    sampling: SamplingService,
    elicitation: ElicitationService,
    roots: Arc<RootsService>,
    ping: Arc<PingService>,
}

impl McpServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            tools: ToolsService::new(config.page_size, config.dynamic_tools),
            resources: ResourcesService::new(config.page_size),
            prompts: PromptsService::new(config.page_size),
            completions: CompletionService::new(),
            logging: LoggingService::new(),
            sampling: SamplingService::new(config.sampling.clone()),
            elicitation: ElicitationService::new(config.elicitation_timeout),
            roots: Arc::new(RootsService::new(config.roots_debounce, config.page_size)),
            ping: Arc::new(PingService::new(config.ping.clone())),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolsService {
        &self.tools
    }

    pub fn resources(&self) -> &ResourcesService {
        &self.resources
    }

    pub fn prompts(&self) -> &PromptsService {
        &self.prompts
    }

    pub fn completions(&self) -> &CompletionService {
        &self.completions
    }

    pub fn logging(&self) -> &LoggingService {
        &self.logging
    }

    pub fn ping(&self) -> &Arc<PingService> {
        &self.ping
    }

    pub fn roots(&self) -> &Arc<RootsService> {
        &self.roots
    }

    /// Capabilities advertised in the `initialize` response.
    pub fn capabilities(&self) -> ServerCapabilities {
        let flags = self.config.notifications;
        ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: flags.tools_changed,
            }),
            resources: Some(ResourcesCapability {
                subscribe: true,
                list_changed: flags.resources_changed,
            }),
            prompts: Some(PromptsCapability {
                list_changed: flags.prompts_changed,
            }),
            completions: Some(CompletionsCapability {}),
            logging: Some(LoggingCapability {}),
            experimental: None,
        }
    }

    // ===== Server -> client operations =====

    /// Proxy `sampling/createMessage` to the client.
    pub async fn request_sampling(
        &self,
        session: &Arc<Session>,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult> {
        self.sampling.create_message(session, params).await
    }

    /// Proxy `elicitation/create` to the client.
    pub async fn request_elicitation(
        &self,
        session: &Arc<Session>,
        params: ElicitParams,
    ) -> Result<ElicitResult> {
        self.elicitation.create(session, params).await
    }

    /// Page through the session's cached roots.
    pub async fn list_roots(
        &self,
        session: &Arc<Session>,
        cursor: Option<&str>,
    ) -> Result<ListRootsResult> {
        self.roots.list(session, cursor).await
    }

    /// Reference monitor for the session's current roots snapshot.
    pub async fn root_guard(&self, session: &Arc<Session>) -> Arc<RootGuard> {
        self.roots.guard(session.id()).await
    }

    // ===== Notifications to clients =====

    pub async fn notify_resource_updated(&self, uri: &str) {
        self.resources.notify_updated(uri).await;
    }

    pub async fn notify_tools_list_changed(&self) {
        if self.config.notifications.tools_changed {
            self.tools.notify_list_changed().await;
        } else if self.config.dynamic_tools {
            warn!(
                "tools/list_changed requested but the capability flag is off; \
                 clients will not learn about dynamic changes"
            );
        }
    }

    pub async fn notify_resources_list_changed(&self) {
        if self.config.notifications.resources_changed {
            self.resources.notify_list_changed().await;
        }
    }

    pub async fn notify_prompts_list_changed(&self) {
        if self.config.notifications.prompts_changed {
            self.prompts.notify_list_changed().await;
        }
    }

    /// Emit a structured log record to subscribed sessions.
    pub async fn log_message(&self, level: LoggingLevel, data: Value, logger: Option<&str>) {
        self.logging.emit(level, data, logger).await;
    }

    // ===== Inbound dispatch =====

    /// Handle one decoded frame. Requests produce a response; notifications
    /// and responses do not.
    pub async fn handle_message(
        &self,
        session: &Arc<Session>,
        message: Message,
    ) -> Option<JsonRpcResponse> {
        match message {
            Message::Request(req) => Some(self.handle_request(session, req).await),
            Message::Notification(notif) => {
                self.handle_notification(session, notif.method.as_str(), notif.params)
                    .await;
                None
            }
            Message::Response(resp) => {
                session.resolve_response(resp).await;
                None
            }
        }
    }

    /// Dispatch a request and build its response. The response always
    /// carries the originating request id.
    pub async fn handle_request(
        &self,
        session: &Arc<Session>,
        req: JsonRpcRequest,
    ) -> JsonRpcResponse {
        debug!(method = %req.method, id = %req.id, "handling request");
        self.ping.touch(session.id()).await;

        let id = req.id.clone();
        match self.dispatch(session, req).await {
            Ok(value) => JsonRpcResponse::ok(id, value),
            Err(e) => JsonRpcResponse::err(id, e.to_jsonrpc()),
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        req: JsonRpcRequest,
    ) -> Result<Value> {
        let JsonRpcRequest {
            id, method, params, ..
        } = req;

        match method.as_str() {
            // Lifecycle methods are legal in any state.
            methods::INITIALIZE => self.handle_initialize(session, id, params).await,
            methods::PING => Ok(serde_json::json!({})),

            // Client-side methods arriving at the server are a direction
            // violation, reported before the readiness gate.
            methods::ROOTS_LIST
            | methods::SAMPLING_CREATE_MESSAGE
            | methods::ELICITATION_CREATE => Err(Error::MethodNotFound(method.clone())),

            _ => {
                if !session.is_ready().await {
                    return Err(Error::NotInitialized);
                }
                match method.as_str() {
                    methods::TOOLS_LIST => {
                        let params = optional_params::<PaginatedParams>(params)?;
                        if self.config.notifications.tools_changed {
                            self.tools.observe(session).await;
                        }
                        let result = self.tools.list(params.cursor.as_deref()).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::TOOLS_CALL => {
                        let params: CallToolParams = required_params(params)?;
                        let result = self.tools.call(&params.name, params.arguments).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::RESOURCES_LIST => {
                        let params = optional_params::<PaginatedParams>(params)?;
                        if self.config.notifications.resources_changed {
                            self.resources.observe(session).await;
                        }
                        let result = self.resources.list(params.cursor.as_deref()).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::RESOURCES_TEMPLATES_LIST => {
                        let params = optional_params::<PaginatedParams>(params)?;
                        let result = self
                            .resources
                            .list_templates(params.cursor.as_deref())
                            .await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::RESOURCES_READ => {
                        let uri = required_uri(params)?;
                        let result = self.resources.read(&uri).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::RESOURCES_SUBSCRIBE => {
                        let uri = required_uri(params)?;
                        self.resources.subscribe(&uri, session).await;
                        Ok(serde_json::json!({}))
                    }
                    methods::RESOURCES_UNSUBSCRIBE => {
                        let uri = required_uri(params)?;
                        self.resources.unsubscribe(&uri, session.id()).await;
                        Ok(serde_json::json!({}))
                    }
                    methods::PROMPTS_LIST => {
                        let params = optional_params::<PaginatedParams>(params)?;
                        if self.config.notifications.prompts_changed {
                            self.prompts.observe(session).await;
                        }
                        let result = self.prompts.list(params.cursor.as_deref()).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::PROMPTS_GET => {
                        #[derive(serde::Deserialize)]
                        struct GetPromptParams {
                            name: String,
                            #[serde(default)]
                            arguments: HashMap<String, String>,
                        }
                        let params: GetPromptParams = required_params(params)?;
                        let result = self.prompts.get(&params.name, params.arguments).await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::COMPLETION_COMPLETE => {
                        let params: CompleteParams = required_params(params)?;
                        let result = self
                            .completions
                            .complete(params.r#ref, params.argument, params.context)
                            .await?;
                        Ok(serde_json::to_value(result)?)
                    }
                    methods::LOGGING_SET_LEVEL => {
                        let params: SetLevelParams = required_params(params)?;
                        let level: LoggingLevel = params.level.parse()?;
                        self.logging.set_level(session, level).await?;
                        Ok(serde_json::json!({}))
                    }
                    other => Err(Error::MethodNotFound(other.to_string())),
                }
            }
        }
    }

    async fn handle_initialize(
        &self,
        session: &Arc<Session>,
        id: crate::protocol::RequestId,
        params: Option<Value>,
    ) -> Result<Value> {
        if session.state().await != SessionState::New {
            return Err(Error::InvalidRequest("already initialized".to_string()));
        }

        let params: InitializeParams = required_params(params)?;
        let negotiated = crate::protocol::negotiate_version(&params.protocol_version);
        info!(
            client = %params.client_info.name,
            requested = %params.protocol_version,
            negotiated,
            "initializing session"
        );

        session
            .record_initialize(
                PeerInfo {
                    client_info: params.client_info,
                    capabilities: params.capabilities,
                    protocol_version: negotiated.to_string(),
                },
                id,
            )
            .await;

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: self.capabilities(),
            server_info: Implementation {
                name: self.config.name.clone(),
                version: self.config.version.clone(),
                title: None,
            },
            instructions: self.config.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Handle a notification frame.
    pub async fn handle_notification(
        &self,
        session: &Arc<Session>,
        method: &str,
        params: Option<Value>,
    ) {
        debug!(method, "handling notification");
        match method {
            methods::INITIALIZED => {
                session.mark_ready().await;
                self.ping.register(session).await;
                // The roots fetch issues a request back to the client; it
                // must not block the read loop that will deliver the reply.
                let roots = self.roots.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    roots.on_session_open(&session).await;
                });
            }
            methods::CANCELLED => {
                match params.map(serde_json::from_value::<CancelledParams>) {
                    Some(Ok(cancelled)) => {
                        debug!(id = %cancelled.request_id, reason = ?cancelled.reason, "cancelling request");
                        session.cancel_inflight(&cancelled.request_id).await;
                    }
                    _ => debug!("malformed cancellation notification"),
                }
            }
            methods::ROOTS_LIST_CHANGED => {
                self.roots.clone().on_list_changed(session).await;
            }
            methods::PROGRESS => {
                // Progress for server-initiated requests; nothing to route
                // in the core.
            }
            other => {
                debug!(method = other, "ignoring unknown notification");
            }
        }
    }

    /// Spawn the handler task for one inbound request. The request runs in
    /// its own cancel scope: a `notifications/cancelled` for its id stops
    /// the work and suppresses the response.
    pub fn spawn_request(self: Arc<Self>, session: &Arc<Session>, req: JsonRpcRequest) {
        let server = self;
        let session = session.clone();
        tokio::spawn(async move {
            let id = req.id.clone();
            let token = session.register_inflight(id.clone()).await;

            let response = tokio::select! {
                _ = token.cancelled() => None,
                response = server.handle_request(&session, req) => Some(response),
            };
            session.finish_inflight(&id).await;

            if let Some(response) = response {
                if let Err(e) = session.send(Message::Response(response)).await {
                    debug!(error = %e, "failed to send response");
                }
            }
        });
    }

    /// Serve one session over a transport until it ends.
    pub async fn run<T: Transport>(self: Arc<Self>, mut transport: T) -> Result<()> {
        info!(
            server = %self.config.name,
            version = %self.config.version,
            "starting MCP server"
        );
        self.tools.mark_started();

        let (mut incoming, outgoing) = transport.start().await?;
        let session = Session::new(Uuid::new_v4().to_string(), outgoing);

        while let Some(message) = incoming.recv().await {
            match message {
                Message::Request(req) => self.clone().spawn_request(&session, req),
                other => {
                    self.handle_message(&session, other).await;
                }
            }
        }

        self.release_session(&session).await;
        transport.stop().await?;
        info!("MCP server stopped");
        Ok(())
    }

    /// Close a session and drop it from every registry.
    pub async fn release_session(&self, session: &Arc<Session>) {
        session.close().await;
        let id = session.id();
        self.tools.prune_session(id).await;
        self.resources.prune_session(id).await;
        self.prompts.prune_session(id).await;
        self.logging.prune_session(id).await;
        self.sampling.prune_session(id).await;
        self.elicitation.prune_session(id).await;
        self.roots.prune_session(id).await;
        self.ping.prune_session(id).await;
    }
}

fn required_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let value = params.ok_or_else(|| Error::invalid_params("Missing params"))?;
    serde_json::from_value(value).map_err(|e| Error::invalid_params(e.to_string()))
}

fn optional_params<T: serde::de::DeserializeOwned + Default>(params: Option<Value>) -> Result<T> {
    match params {
        Some(value) => {
            serde_json::from_value(value).map_err(|e| Error::invalid_params(e.to_string()))
        }
        None => Ok(T::default()),
    }
}

fn required_uri(params: Option<Value>) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct UriParams {
        uri: String,
    }
    required_params::<UriParams>(params).map(|p| p.uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationFlags;
    use crate::protocol::RequestId;
    use crate::services::{ToolOutput, ToolSpec};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request(id: i64, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(RequestId::Number(id), method, params)
    }

    fn init_params() -> Value {
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "0.0.1" }
        })
    }

    async fn server_with_session() -> (Arc<McpServer>, Arc<Session>, mpsc::Receiver<Message>) {
        let server = McpServer::new(
            ServerConfig::new("test-server", "0.0.0").with_notifications(NotificationFlags {
                tools_changed: true,
                resources_changed: true,
                prompts_changed: true,
            }),
        );
        let (tx, rx) = mpsc::channel(32);
        let session = Session::new("test", tx);
        (server, session, rx)
    }

    async fn initialize(server: &Arc<McpServer>, session: &Arc<Session>) {
        let resp = server
            .handle_request(session, request(1, "initialize", Some(init_params())))
            .await;
        assert!(resp.error.is_none(), "{:?}", resp.error);
        server
            .handle_notification(session, "notifications/initialized", None)
            .await;
    }

    #[tokio::test]
    async fn test_requests_gated_until_initialized() {
        let (server, session, _rx) = server_with_session().await;

        // Non-lifecycle request before initialize.
        let resp = server
            .handle_request(&session, request(1, "tools/list", None))
            .await;
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32002));

        // Ping is allowed in any state.
        let resp = server.handle_request(&session, request(2, "ping", None)).await;
        assert!(resp.error.is_none());

        // Initialize answers but does not unlock yet.
        let resp = server
            .handle_request(&session, request(3, "initialize", Some(init_params())))
            .await;
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2025-06-18");
        assert_eq!(result["serverInfo"]["name"], "test-server");

        let resp = server
            .handle_request(&session, request(4, "tools/list", None))
            .await;
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32002));

        // notifications/initialized unlocks.
        server
            .handle_notification(&session, "notifications/initialized", None)
            .await;
        let resp = server
            .handle_request(&session, request(5, "tools/list", None))
            .await;
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let (server, session, _rx) = server_with_session().await;
        initialize(&server, &session).await;

        let resp = server
            .handle_request(&session, request(9, "initialize", Some(init_params())))
            .await;
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32600));
    }

    #[tokio::test]
    async fn test_unknown_version_negotiates_latest() {
        let (server, session, _rx) = server_with_session().await;
        let params = json!({
            "protocolVersion": "1990-01-01",
            "capabilities": {},
            "clientInfo": { "name": "old", "version": "0" }
        });
        let resp = server
            .handle_request(&session, request(1, "initialize", Some(params)))
            .await;
        assert_eq!(
            resp.result.unwrap()["protocolVersion"],
            crate::protocol::LATEST_PROTOCOL_VERSION
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (server, session, _rx) = server_with_session().await;
        initialize(&server, &session).await;

        let resp = server
            .handle_request(&session, request(7, "tools/destroy", None))
            .await;
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32601));
    }

    #[tokio::test]
    async fn test_direction_enforcement() {
        let (server, session, _rx) = server_with_session().await;
        initialize(&server, &session).await;

        for method in ["roots/list", "sampling/createMessage", "elicitation/create"] {
            let resp = server
                .handle_request(&session, request(8, method, Some(json!({}))))
                .await;
            assert_eq!(
                resp.error.as_ref().map(|e| e.code),
                Some(-32601),
                "{method} should be unknown server-side"
            );
        }
    }

    #[tokio::test]
    async fn test_tool_call_end_to_end() {
        let (server, session, _rx) = server_with_session().await;
        server
            .tools()
            .register(ToolSpec::new(
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
            ))
            .await
            .unwrap();
        initialize(&server, &session).await;

        let resp = server
            .handle_request(
                &session,
                request(
                    10,
                    "tools/call",
                    Some(json!({"name": "add", "arguments": {"a": 2, "b": 3}})),
                ),
            )
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["content"][0]["text"], "5");
        assert_eq!(result["structuredContent"]["result"], 5);
        assert_eq!(result["isError"], false);
    }

    #[tokio::test]
    async fn test_unknown_tool_call() {
        let (server, session, _rx) = server_with_session().await;
        initialize(&server, &session).await;

        let resp = server
            .handle_request(
                &session,
                request(11, "tools/call", Some(json!({"name": "missing", "arguments": {}}))),
            )
            .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, -32602);
        assert!(error.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_set_level_rejects_unknown_level() {
        let (server, session, _rx) = server_with_session().await;
        initialize(&server, &session).await;

        let resp = server
            .handle_request(
                &session,
                request(12, "logging/setLevel", Some(json!({"level": "loud"}))),
            )
            .await;
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32602));
    }

    #[tokio::test]
    async fn test_cancelled_request_sends_no_response() {
        let (server, session, mut rx) = server_with_session().await;
        server
            .tools()
            .register(ToolSpec::new(
                "slow",
                "Sleeps forever",
                json!({"type": "object"}),
                |_: serde_json::Map<String, Value>| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ToolOutput::Text("done".into()))
                },
            ))
            .await
            .unwrap();
        initialize(&server, &session).await;

        server.clone().spawn_request(
            &session,
            request(20, "tools/call", Some(json!({"name": "slow", "arguments": {}}))),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        server
            .handle_notification(
                &session,
                "notifications/cancelled",
                Some(json!({"requestId": 20, "reason": "user"})),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // No response frame for the cancelled id, and never two frames.
        let mut responses = 0;
        while let Ok(m) = rx.try_recv() {
            if matches!(m, Message::Response(_)) {
                responses += 1;
            }
        }
        assert_eq!(responses, 0);
    }

    #[tokio::test]
    async fn test_completed_request_ignores_late_cancel() {
        let (server, session, mut rx) = server_with_session().await;
        server
            .tools()
            .register(ToolSpec::new(
                "fast",
                "Returns at once",
                json!({"type": "object"}),
                |_: serde_json::Map<String, Value>| async { Ok(ToolOutput::Text("done".into())) },
            ))
            .await
            .unwrap();
        initialize(&server, &session).await;

        server.clone().spawn_request(
            &session,
            request(21, "tools/call", Some(json!({"name": "fast", "arguments": {}}))),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        server
            .handle_notification(
                &session,
                "notifications/cancelled",
                Some(json!({"requestId": 21})),
            )
            .await;

        let mut responses = 0;
        while let Ok(m) = rx.try_recv() {
            if matches!(m, Message::Response(_)) {
                responses += 1;
            }
        }
        assert_eq!(responses, 1);
    }

    #[tokio::test]
    async fn test_release_session_cleans_registries() {
        let (server, session, _rx) = server_with_session().await;
        initialize(&server, &session).await;

        server
            .handle_request(
                &session,
                request(
                    30,
                    "resources/subscribe",
                    Some(json!({"uri": "resource://demo"})),
                ),
            )
            .await;
        server.release_session(&session).await;

        assert!(session.is_closed());
        assert!(!server
            .resources()
            .subscriptions()
            .is_subscribed("resource://demo", session.id())
            .await);
    }
}
