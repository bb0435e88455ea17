//! Prompts capability service.
//!
//! Prompt templates with typed arguments. Renderers return either full
//! message lists or plain text that is coerced into a single user message.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::pagination;
use crate::protocol::methods;
use crate::protocol::types::{
    ContentBlock, GetPromptResult, ListPromptsResult, Prompt, PromptArgument, PromptMessage, Role,
};
use crate::registry::ObserverRegistry;
use crate::session::{Session, SessionId};

/// Renderer invoked by `prompts/get`.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn render(&self, arguments: HashMap<String, String>) -> Result<PromptPayload>;
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<PromptPayload>> + Send,
{
    async fn render(&self, arguments: HashMap<String, String>) -> Result<PromptPayload> {
        self(arguments).await
    }
}

/// What a prompt renderer may return.
#[derive(Debug)]
pub enum PromptPayload {
    /// A fully-built result, passed through.
    Result(GetPromptResult),
    /// An ordered message sequence.
    Messages(Vec<PromptMessage>),
    /// Plain text, coerced to a single user message.
    Text(String),
}

/// Prompt descriptor plus its renderer.
pub struct PromptSpec {
    def: Prompt,
    handler: Arc<dyn PromptHandler>,
}

impl PromptSpec {
    pub fn new(name: impl Into<String>, handler: impl PromptHandler + 'static) -> Self {
        Self {
            def: Prompt {
                name: name.into(),
                description: None,
                arguments: Vec::new(),
            },
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.def.description = Some(description.into());
        self
    }

    /// Declare an argument. Missing required arguments fail `prompts/get`
    /// before the renderer runs.
    pub fn with_argument(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.def.arguments.push(PromptArgument {
            name: name.into(),
            description: Some(description.into()),
            required,
        });
        self
    }
}

/// Prompts service: registry, rendering, and list-change fan-out.
pub struct PromptsService {
    specs: Mutex<BTreeMap<String, Arc<PromptSpec>>>,
    observers: ObserverRegistry,
    page_size: usize,
}

impl PromptsService {
    pub fn new(page_size: usize) -> Self {
        Self {
            specs: Mutex::new(BTreeMap::new()),
            observers: ObserverRegistry::new(),
            page_size,
        }
    }

    /// Register a prompt. Duplicate names replace the prior entry.
    pub async fn register(&self, spec: PromptSpec) {
        self.specs
            .lock()
            .await
            .insert(spec.def.name.clone(), Arc::new(spec));
    }

    pub async fn prompt_names(&self) -> Vec<String> {
        self.specs.lock().await.keys().cloned().collect()
    }

    /// Paginated `prompts/list`.
    pub async fn list(&self, cursor: Option<&str>) -> Result<ListPromptsResult> {
        let prompts: Vec<Prompt> = {
            let specs = self.specs.lock().await;
            specs.values().map(|s| s.def.clone()).collect()
        };
        let (page, next_cursor) = pagination::paginate(&prompts, cursor, self.page_size)?;
        Ok(ListPromptsResult {
            prompts: page,
            next_cursor,
        })
    }

    /// `prompts/get`: validate required arguments, render, coerce.
    pub async fn get(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let spec = self.specs.lock().await.get(name).cloned().ok_or_else(|| {
            Error::invalid_params_data(
                format!("Unknown prompt: {name}"),
                serde_json::json!({ "prompt": name }),
            )
        })?;

        for arg in &spec.def.arguments {
            if arg.required && !arguments.contains_key(&arg.name) {
                return Err(Error::invalid_params_data(
                    format!("Missing required argument: {}", arg.name),
                    serde_json::json!({ "argument": arg.name, "constraint": "required" }),
                ));
            }
        }

        let payload = spec.handler.render(arguments).await?;
        let result = match payload {
            PromptPayload::Result(result) => result,
            PromptPayload::Messages(messages) => GetPromptResult {
                description: spec.def.description.clone(),
                messages,
            },
            PromptPayload::Text(text) => GetPromptResult {
                description: spec.def.description.clone(),
                messages: vec![PromptMessage {
                    role: Role::User,
                    content: ContentBlock::text(text),
                }],
            },
        };

        if result.messages.is_empty() {
            return Err(Error::Internal(format!(
                "Prompt '{name}' rendered no messages"
            )));
        }
        Ok(result)
    }

    pub async fn notify_list_changed(&self) {
        self.observers
            .broadcast(methods::PROMPTS_LIST_CHANGED, None)
            .await;
    }

    pub async fn observe(&self, session: &Arc<Session>) {
        self.observers.observe(session).await;
    }

    pub async fn prune_session(&self, id: &SessionId) {
        self.observers.prune_session(id).await;
    }
}
