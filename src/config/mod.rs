//! Server configuration.
//!
//! Everything is passed programmatically; the only environment hooks the
//! core recognizes are the two tracing variables handled by
//! [`init_tracing`].

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::pagination::DEFAULT_PAGE_SIZE;
use crate::services::{PingConfig, SamplingConfig};

/// Env var controlling the process-wide log threshold.
pub const LOG_LEVEL_ENV: &str = "CONDUIT_MCP_LOG";
/// Env var switching log emission to structured JSON.
pub const LOG_FORMAT_ENV: &str = "CONDUIT_MCP_LOG_FORMAT";

/// Which list-changed notifications the server advertises and emits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationFlags {
    pub tools_changed: bool,
    pub resources_changed: bool,
    pub prompts_changed: bool,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name reported in `initialize`.
    pub name: String,
    /// Server version reported in `initialize`.
    pub version: String,
    /// Optional usage instructions for the client.
    pub instructions: Option<String>,
    /// Page size for every `*/list` operation.
    pub page_size: usize,
    /// Advertised list-changed notifications.
    pub notifications: NotificationFlags,
    /// Allow registry mutation after serving starts. Mutations then require
    /// a `tools/list_changed` emission.
    pub dynamic_tools: bool,
    /// Sampling proxy tunables.
    pub sampling: SamplingConfig,
    /// Elicitation request timeout.
    pub elicitation_timeout: Duration,
    /// Heartbeat tunables.
    pub ping: PingConfig,
    /// Quiet period before a roots refresh after `roots/list_changed`.
    pub roots_debounce: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            instructions: None,
            page_size: DEFAULT_PAGE_SIZE,
            notifications: NotificationFlags::default(),
            dynamic_tools: false,
            sampling: SamplingConfig::default(),
            elicitation_timeout: Duration::from_secs(60),
            ping: PingConfig::default(),
            roots_debounce: Duration::from_millis(250),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_notifications(mut self, flags: NotificationFlags) -> Self {
        self.notifications = flags;
        self
    }

    pub fn with_dynamic_tools(mut self) -> Self {
        self.dynamic_tools = true;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_ping(mut self, ping: PingConfig) -> Self {
        self.ping = ping;
        self
    }

    pub fn with_roots_debounce(mut self, debounce: Duration) -> Self {
        self.roots_debounce = debounce;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("conduit-mcp", env!("CARGO_PKG_VERSION"))
    }
}

/// Initialize process-wide tracing from the recognized env hooks.
///
/// Diagnostics go to stderr so the STDIO transport keeps stdout clean.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A second init (tests, embedding applications) is fine.
    let _ = result;
}
