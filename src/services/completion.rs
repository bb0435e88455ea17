//! Completion capability service.
//!
//! Argument autocompletion providers, bound to either a prompt name or a
//! resource template URI. Providers return candidate values; the service
//! enforces the 100-value ceiling and reports truncation via `hasMore`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::types::{
    CompleteResult, Completion, CompletionArgument, CompletionContext, CompletionReference,
};

/// Maximum number of values returned in one completion response.
const MAX_COMPLETION_VALUES: usize = 100;

/// Provider invoked by `completion/complete` for one reference.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Produce candidate values for `argument`. `context` carries arguments
    /// the client already settled on, for multi-argument completion.
    async fn complete(
        &self,
        argument: CompletionArgument,
        context: Option<CompletionContext>,
    ) -> Result<Vec<String>>;
}

#[async_trait]
impl<F, Fut> CompletionProvider for F
where
    F: Fn(CompletionArgument, Option<CompletionContext>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<String>>> + Send,
{
    async fn complete(
        &self,
        argument: CompletionArgument,
        context: Option<CompletionContext>,
    ) -> Result<Vec<String>> {
        self(argument, context).await
    }
}

/// Completion service: provider registry keyed by reference.
#[derive(Default)]
pub struct CompletionService {
    providers: Mutex<HashMap<CompletionReference, Arc<dyn CompletionProvider>>>,
}

impl CompletionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a provider to a prompt name.
    pub async fn register_for_prompt(
        &self,
        name: impl Into<String>,
        provider: impl CompletionProvider + 'static,
    ) {
        self.providers.lock().await.insert(
            CompletionReference::Prompt { name: name.into() },
            Arc::new(provider),
        );
    }

    /// Bind a provider to a resource template URI.
    pub async fn register_for_template(
        &self,
        uri: impl Into<String>,
        provider: impl CompletionProvider + 'static,
    ) {
        self.providers.lock().await.insert(
            CompletionReference::ResourceTemplate { uri: uri.into() },
            Arc::new(provider),
        );
    }

    /// `completion/complete`. A missing provider yields an empty result
    /// rather than an error.
    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: CompletionArgument,
        context: Option<CompletionContext>,
    ) -> Result<CompleteResult> {
        let provider = self.providers.lock().await.get(&reference).cloned();
        let Some(provider) = provider else {
            return Ok(CompleteResult {
                completion: Completion {
                    values: Vec::new(),
                    total: Some(0),
                    has_more: false,
                },
            });
        };

        let mut values = provider.complete(argument, context).await?;
        let total = values.len();
        let has_more = total > MAX_COMPLETION_VALUES;
        values.truncate(MAX_COMPLETION_VALUES);

        Ok(CompleteResult {
            completion: Completion {
                values,
                total: Some(total),
                has_more,
            },
        })
    }
}
