//! Resources capability service.
//!
//! Static resources and URI templates, payload normalization into text or
//! base64 blobs, and the subscribe/updated fan-out backed by the
//! subscription registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::pagination;
use crate::protocol::methods;
use crate::protocol::types::{
    ListResourceTemplatesResult, ListResourcesResult, ReadResourceResult, Resource,
    ResourceContents, ResourceTemplate,
};
use crate::registry::{ObserverRegistry, SubscriptionRegistry};
use crate::session::{Session, SessionId};

/// Default MIME type for text payloads without an explicit type.
const DEFAULT_TEXT_MIME: &str = "text/plain";
/// Default MIME type for binary payloads without an explicit type.
const DEFAULT_BLOB_MIME: &str = "application/octet-stream";

/// Handler invoked by `resources/read`. Template parameters extracted from
/// the URI are passed by name; static resources receive an empty map.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: &str, params: HashMap<String, String>) -> Result<ResourcePayload>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(String, HashMap<String, String>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ResourcePayload>> + Send,
{
    async fn read(&self, uri: &str, params: HashMap<String, String>) -> Result<ResourcePayload> {
        self(uri.to_string(), params).await
    }
}

/// What a resource handler may return.
#[derive(Debug)]
pub enum ResourcePayload {
    /// A fully-built read result, passed through.
    Result(ReadResourceResult),
    /// A single pre-built content item.
    Contents(ResourceContents),
    /// Multiple pre-built content items.
    Many(Vec<ResourceContents>),
    /// Plain text (`text/plain` unless the spec declares otherwise).
    Text(String),
    /// Raw bytes, base64-encoded on the wire.
    Bytes(Vec<u8>),
    /// Any JSON value, serialized into a text payload.
    Json(Value),
}

/// Normalize a handler payload into the wire shape. `declared_mime` is the
/// MIME type from the resource spec and overrides the payload defaults.
pub fn normalize_resource_payload(
    uri: &str,
    declared_mime: Option<&str>,
    payload: ResourcePayload,
) -> ReadResourceResult {
    let mime_or = |fallback: &str| Some(declared_mime.unwrap_or(fallback).to_string());
    match payload {
        ResourcePayload::Result(result) => result,
        ResourcePayload::Contents(contents) => ReadResourceResult {
            contents: vec![contents],
        },
        ResourcePayload::Many(contents) => ReadResourceResult { contents },
        ResourcePayload::Text(text) => ReadResourceResult {
            contents: vec![ResourceContents {
                uri: uri.to_string(),
                mime_type: mime_or(DEFAULT_TEXT_MIME),
                text: Some(text),
                blob: None,
            }],
        },
        ResourcePayload::Bytes(bytes) => ReadResourceResult {
            contents: vec![ResourceContents {
                uri: uri.to_string(),
                mime_type: mime_or(DEFAULT_BLOB_MIME),
                text: None,
                blob: Some(BASE64.encode(bytes)),
            }],
        },
        ResourcePayload::Json(value) => {
            let text = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
            ReadResourceResult {
                contents: vec![ResourceContents {
                    uri: uri.to_string(),
                    mime_type: mime_or("application/json"),
                    text: Some(text),
                    blob: None,
                }],
            }
        }
    }
}

/// Static resource descriptor plus its handler.
pub struct ResourceSpec {
    def: Resource,
    handler: Arc<dyn ResourceHandler>,
}

impl ResourceSpec {
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        handler: impl ResourceHandler + 'static,
    ) -> Self {
        Self {
            def: Resource {
                uri: uri.into(),
                name: name.into(),
                description: None,
                mime_type: None,
            },
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.def.description = Some(description.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.def.mime_type = Some(mime.into());
        self
    }
}

/// URI template descriptor plus its handler.
pub struct ResourceTemplateSpec {
    def: ResourceTemplate,
    handler: Arc<dyn ResourceHandler>,
}

impl ResourceTemplateSpec {
    pub fn new(
        uri_template: impl Into<String>,
        name: impl Into<String>,
        handler: impl ResourceHandler + 'static,
    ) -> Self {
        Self {
            def: ResourceTemplate {
                uri_template: uri_template.into(),
                name: name.into(),
                description: None,
                mime_type: None,
            },
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.def.description = Some(description.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.def.mime_type = Some(mime.into());
        self
    }
}

/// Match `uri` against a `{var}` template, extracting variable values.
/// Variables match one path segment (no `/`).
fn match_template(template: &str, uri: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut remaining = uri;
    let mut parts = template.split('{');

    let literal = parts.next()?;
    remaining = remaining.strip_prefix(literal)?;

    for part in parts {
        let (var, literal) = part.split_once('}')?;
        let value = if literal.is_empty() {
            // Trailing variable consumes the rest of the URI.
            std::mem::take(&mut remaining)
        } else {
            let end = remaining.find(literal)?;
            let value = &remaining[..end];
            remaining = &remaining[end + literal.len()..];
            value
        };
        if value.is_empty() || value.contains('/') {
            return None;
        }
        params.insert(var.to_string(), value.to_string());
    }

    remaining.is_empty().then_some(params)
}

#[derive(Default)]
struct ResourcesInner {
    resources: BTreeMap<String, Arc<ResourceSpec>>,
    templates: BTreeMap<String, Arc<ResourceTemplateSpec>>,
}

/// Resources service: registries, read dispatch, and both notification
/// channels (list-changed and per-URI updated).
pub struct ResourcesService {
    inner: Mutex<ResourcesInner>,
    subscriptions: SubscriptionRegistry,
    observers: ObserverRegistry,
    page_size: usize,
}

impl ResourcesService {
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(ResourcesInner::default()),
            subscriptions: SubscriptionRegistry::new(),
            observers: ObserverRegistry::new(),
            page_size,
        }
    }

    /// Register a static resource. Duplicate URIs replace the prior entry.
    pub async fn register(&self, spec: ResourceSpec) {
        self.inner
            .lock()
            .await
            .resources
            .insert(spec.def.uri.clone(), Arc::new(spec));
    }

    /// Register a URI template.
    pub async fn register_template(&self, spec: ResourceTemplateSpec) {
        self.inner
            .lock()
            .await
            .templates
            .insert(spec.def.uri_template.clone(), Arc::new(spec));
    }

    /// Paginated `resources/list`.
    pub async fn list(&self, cursor: Option<&str>) -> Result<ListResourcesResult> {
        let resources: Vec<Resource> = {
            let inner = self.inner.lock().await;
            inner.resources.values().map(|s| s.def.clone()).collect()
        };
        let (page, next_cursor) = pagination::paginate(&resources, cursor, self.page_size)?;
        Ok(ListResourcesResult {
            resources: page,
            next_cursor,
        })
    }

    /// Paginated `resources/templates/list`.
    pub async fn list_templates(&self, cursor: Option<&str>) -> Result<ListResourceTemplatesResult> {
        let templates: Vec<ResourceTemplate> = {
            let inner = self.inner.lock().await;
            inner.templates.values().map(|s| s.def.clone()).collect()
        };
        let (page, next_cursor) = pagination::paginate(&templates, cursor, self.page_size)?;
        Ok(ListResourceTemplatesResult {
            resource_templates: page,
            next_cursor,
        })
    }

    /// `resources/read`: resolve a static URI or match a template.
    pub async fn read(&self, uri: &str) -> Result<ReadResourceResult> {
        let resolved = {
            let inner = self.inner.lock().await;
            if let Some(spec) = inner.resources.get(uri) {
                Some((spec.handler.clone(), spec.def.mime_type.clone(), HashMap::new()))
            } else {
                inner.templates.values().find_map(|spec| {
                    match_template(&spec.def.uri_template, uri).map(|params| {
                        (spec.handler.clone(), spec.def.mime_type.clone(), params)
                    })
                })
            }
        };

        let Some((handler, mime, params)) = resolved else {
            return Err(Error::ResourceNotFound(uri.to_string()));
        };

        let payload = handler.read(uri, params).await?;
        Ok(normalize_resource_payload(uri, mime.as_deref(), payload))
    }

    /// `resources/subscribe` for the calling session.
    pub async fn subscribe(&self, uri: &str, session: &Arc<Session>) {
        self.subscriptions.subscribe(uri, session).await;
    }

    /// `resources/unsubscribe` for the calling session.
    pub async fn unsubscribe(&self, uri: &str, session_id: &SessionId) {
        self.subscriptions.unsubscribe(uri, session_id).await;
    }

    /// Broadcast `notifications/resources/updated` to all subscribers of
    /// `uri`. Called by collaborators when the underlying data changes.
    pub async fn notify_updated(&self, uri: &str) {
        self.subscriptions
            .notify(
                uri,
                methods::RESOURCES_UPDATED,
                Some(serde_json::json!({ "uri": uri })),
            )
            .await;
    }

    pub async fn notify_list_changed(&self) {
        self.observers
            .broadcast(methods::RESOURCES_LIST_CHANGED, None)
            .await;
    }

    pub async fn observe(&self, session: &Arc<Session>) {
        self.observers.observe(session).await;
    }

    pub async fn prune_session(&self, id: &SessionId) {
        self.observers.prune_session(id).await;
        self.subscriptions.prune_session(id).await;
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }
}
