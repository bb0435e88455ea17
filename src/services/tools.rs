//! Tools capability service.
//!
//! Registry of tool specs with allow-list gating and runtime `enabled`
//! predicates, argument validation against the declared input schema, and
//! normalization of handler return values into `tools/call` results.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::pagination;
use crate::protocol::methods;
use crate::protocol::types::{CallToolResult, ContentBlock, ListToolsResult, Tool};
use crate::registry::ObserverRegistry;
use crate::session::Session;

/// Handler invoked by `tools/call`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ToolOutput>> + Send,
{
    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput> {
        self(arguments).await
    }
}

/// The polymorphic return value of a tool handler, modeled as a tagged union
/// rather than runtime reflection.
#[derive(Debug)]
pub enum ToolOutput {
    /// A fully-built result, passed through untouched.
    Result(CallToolResult),
    /// Any JSON value. Mappings become both a text block and
    /// `structuredContent`; other values are boxed under `{"result": ...}`.
    Json(Value),
    /// Plain text.
    Text(String),
    /// Raw bytes, rendered as a base64 text block.
    Bytes(Vec<u8>),
    /// Pre-built content blocks.
    Blocks(Vec<ContentBlock>),
    /// Content plus explicit structured payload.
    Pair(Box<ToolOutput>, Value),
    /// Multiple outputs, flattened in order.
    Many(Vec<ToolOutput>),
    /// No content.
    None,
}

/// Normalize a handler return value into the wire result shape.
pub fn normalize_tool_output(output: ToolOutput) -> CallToolResult {
    match output {
        ToolOutput::Result(result) => result,
        ToolOutput::Json(value) => {
            let text = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
            let structured = if value.is_object() {
                value
            } else {
                serde_json::json!({ "result": value })
            };
            CallToolResult {
                content: vec![ContentBlock::text(text)],
                structured_content: Some(structured),
                is_error: false,
            }
        }
        ToolOutput::Text(text) => CallToolResult {
            content: vec![ContentBlock::text(text)],
            structured_content: None,
            is_error: false,
        },
        ToolOutput::Bytes(bytes) => CallToolResult {
            content: vec![ContentBlock::text(BASE64.encode(bytes))],
            structured_content: None,
            is_error: false,
        },
        ToolOutput::Blocks(content) => CallToolResult {
            content,
            structured_content: None,
            is_error: false,
        },
        ToolOutput::Pair(payload, structured) => {
            let mut result = normalize_tool_output(*payload);
            result.structured_content = Some(structured);
            result
        }
        ToolOutput::Many(outputs) => {
            let mut content = Vec::new();
            let mut structured = None;
            let mut is_error = false;
            for output in outputs {
                let part = normalize_tool_output(output);
                content.extend(part.content);
                if structured.is_none() {
                    structured = part.structured_content;
                }
                is_error |= part.is_error;
            }
            CallToolResult {
                content,
                structured_content: structured,
                is_error,
            }
        }
        ToolOutput::None => CallToolResult {
            content: Vec::new(),
            structured_content: None,
            is_error: false,
        },
    }
}

type EnabledPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Immutable tool descriptor plus its handler.
pub struct ToolSpec {
    def: Tool,
    enabled: Option<EnabledPredicate>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            def: Tool {
                name: name.into(),
                title: None,
                description: Some(description.into()),
                input_schema,
                output_schema: None,
                annotations: None,
            },
            enabled: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.def.title = Some(title.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.def.output_schema = Some(schema);
        self
    }

    /// Gate this tool behind a runtime predicate. Disabled tools stay
    /// registered but are hidden from listing and dispatch.
    pub fn with_enabled(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled.as_ref().map_or(true, |p| p())
    }
}

#[derive(Default)]
struct ToolsInner {
    specs: BTreeMap<String, Arc<ToolSpec>>,
    allow: Option<HashSet<String>>,
}

/// Tools service: registry, dispatch, and list-change fan-out.
pub struct ToolsService {
    inner: Mutex<ToolsInner>,
    observers: ObserverRegistry,
    page_size: usize,
    dynamic: bool,
    started: AtomicBool,
    pending_notification: AtomicBool,
}

impl ToolsService {
    pub fn new(page_size: usize, dynamic: bool) -> Self {
        Self {
            inner: Mutex::new(ToolsInner::default()),
            observers: ObserverRegistry::new(),
            page_size,
            dynamic,
            started: AtomicBool::new(false),
            pending_notification: AtomicBool::new(false),
        }
    }

    /// Freeze the registry for static servers. Called when serving begins.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn check_mutation(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            if !self.dynamic {
                return Err(Error::Config(
                    "tool registry is frozen; enable dynamic capabilities to mutate it at runtime"
                        .to_string(),
                ));
            }
            self.pending_notification.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Whether a runtime mutation still awaits its `tools/list_changed`.
    pub fn take_pending_notification(&self) -> bool {
        self.pending_notification.swap(false, Ordering::SeqCst)
    }

    /// Register a tool. Duplicate names replace the prior entry.
    pub async fn register(&self, spec: ToolSpec) -> Result<()> {
        self.check_mutation()?;
        let mut inner = self.inner.lock().await;
        if inner.specs.insert(spec.def.name.clone(), Arc::new(spec)).is_some() {
            warn!("replacing previously registered tool");
        }
        Ok(())
    }

    /// Remove a tool by name.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        self.check_mutation()?;
        Ok(self.inner.lock().await.specs.remove(name).is_some())
    }

    /// Restrict listing and dispatch to `names`; `None` clears the
    /// allow-list.
    pub async fn allow_tools(&self, names: Option<Vec<String>>) {
        self.inner.lock().await.allow = names.map(|n| n.into_iter().collect());
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.inner.lock().await.specs.keys().cloned().collect()
    }

    async fn visible(&self) -> Vec<Tool> {
        let inner = self.inner.lock().await;
        inner
            .specs
            .values()
            .filter(|spec| {
                spec.is_enabled()
                    && inner
                        .allow
                        .as_ref()
                        .map_or(true, |allow| allow.contains(spec.name()))
            })
            .map(|spec| spec.def.clone())
            .collect()
    }

    /// Paginated `tools/list`.
    pub async fn list(&self, cursor: Option<&str>) -> Result<ListToolsResult> {
        let tools = self.visible().await;
        let (page, next_cursor) = pagination::paginate(&tools, cursor, self.page_size)?;
        Ok(ListToolsResult {
            tools: page,
            next_cursor,
        })
    }

    /// Dispatch `tools/call`.
    ///
    /// Unknown, disabled, or non-allow-listed names are invalid params.
    /// Handler failures that are not dispatch errors become results with
    /// `isError` set, per the protocol's tool error contract.
    pub async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<CallToolResult> {
        let spec = {
            let inner = self.inner.lock().await;
            let allowed = inner
                .allow
                .as_ref()
                .map_or(true, |allow| allow.contains(name));
            inner
                .specs
                .get(name)
                .filter(|s| allowed && s.is_enabled())
                .cloned()
        };

        let spec = spec.ok_or_else(|| {
            Error::invalid_params_data(
                format!("Unknown tool: {name}"),
                serde_json::json!({ "tool": name }),
            )
        })?;

        validate_arguments(&spec.def.input_schema, &arguments)?;

        match spec.handler.call(arguments).await {
            Ok(output) => Ok(normalize_tool_output(output)),
            // Handler errors travel inside the result, not as JSON-RPC errors.
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }

    /// Arm list-changed fan-out for `session`.
    pub async fn observe(&self, session: &Arc<Session>) {
        self.observers.observe(session).await;
    }

    pub async fn notify_list_changed(&self) {
        self.pending_notification.store(false, Ordering::SeqCst);
        self.observers
            .broadcast(methods::TOOLS_LIST_CHANGED, None)
            .await;
    }

    pub async fn prune_session(&self, id: &crate::session::SessionId) {
        self.observers.prune_session(id).await;
    }
}

/// Structural validation of call arguments against a JSON Schema input
/// declaration. Required properties must be present and primitive `type`
/// declarations must match; deeper keywords are left to the handler.
fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<()> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !arguments.contains_key(name) {
                return Err(Error::invalid_params_data(
                    format!("Missing required argument: {name}"),
                    serde_json::json!({ "argument": name, "constraint": "required" }),
                ));
            }
        }
    }

    let properties = obj.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (name, value) in arguments {
            let Some(declared) = properties.get(name) else {
                if obj.get("additionalProperties") == Some(&Value::Bool(false)) {
                    return Err(Error::invalid_params_data(
                        format!("Unexpected argument: {name}"),
                        serde_json::json!({ "argument": name, "constraint": "additionalProperties" }),
                    ));
                }
                continue;
            };
            if let Some(expected) = declared.get("type").and_then(Value::as_str) {
                if !json_type_matches(expected, value) {
                    return Err(Error::invalid_params_data(
                        format!("Argument '{name}' must be of type {expected}"),
                        serde_json::json!({ "argument": name, "expected": expected }),
                    ));
                }
            }
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
