//! Capability services.
//!
//! One service per MCP capability. The server-side services (tools,
//! resources, prompts, completion, logging) hold registries and session
//! fan-out; the client-facing services (sampling, elicitation, roots, ping)
//! proxy server-initiated requests with their own failure handling.

pub mod completion;
pub mod elicitation;
pub mod logging;
pub mod ping;
pub mod prompts;
pub mod resources;
pub mod roots;
pub mod sampling;
pub mod tools;

pub use completion::{CompletionProvider, CompletionService};
pub use elicitation::ElicitationService;
pub use logging::LoggingService;
pub use ping::{PingConfig, PingService, SessionHealth};
pub use prompts::{PromptHandler, PromptPayload, PromptSpec, PromptsService};
pub use resources::{
    ResourceHandler, ResourcePayload, ResourceSpec, ResourceTemplateSpec, ResourcesService,
};
pub use roots::{RootGuard, RootsService};
pub use sampling::{SamplingConfig, SamplingService};
pub use tools::{ToolHandler, ToolOutput, ToolSpec, ToolsService};
