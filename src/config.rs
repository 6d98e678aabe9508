//! Engine and LLM configuration values.
//!
//! The core never reads the environment: configuration is built by the
//! outer harness (`main.rs`) and threaded into components as plain values.
//! [`LlmConfig::from_env`] is the single, explicit place where the
//! `OLLAMA_*` variables are consulted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::llm::ThinkMode;

/// Default local Ollama endpoint.
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434";

/// Cloud endpoint used when an API key is configured without a host.
pub const DEFAULT_CLOUD_BASE_URL: &str = "https://ollama.com";

/// Connection settings for the model runtime.
///
/// # Example
///
/// ```
/// use brewol::config::LlmConfig;
///
/// let cfg = LlmConfig::default().with_model("qwen2.5-coder");
/// assert_eq!(cfg.model.as_deref(), Some("qwen2.5-coder"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the Ollama API (trailing slash stripped).
    pub base_url: String,
    /// Optional bearer token for cloud endpoints.
    pub api_key: Option<String>,
    /// Model name. `None` means not yet selected.
    pub model: Option<String>,
    /// Explicit context-window override. `None` uses the model lookup table.
    pub num_ctx: Option<u32>,
    /// Thinking-mode setting.
    pub think_mode: ThinkMode,
    /// Keep-alive passthrough value. Carried for the CLI surface; the
    /// streaming path does not thread it into request bodies.
    pub keep_alive: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LOCAL_BASE_URL.to_string(),
            api_key: None,
            model: None,
            num_ctx: None,
            think_mode: ThinkMode::Auto,
            keep_alive: None,
        }
    }
}

impl LlmConfig {
    /// Build a config from the `OLLAMA_*` environment variables.
    ///
    /// Resolution rules:
    /// - `OLLAMA_HOST` sets the base URL (trailing slash stripped);
    /// - when unset but `OLLAMA_API_KEY` is present, the cloud URL is used;
    /// - `OLLAMA_MODEL` and `OLLAMA_KEEP_ALIVE` are taken verbatim.
    ///
    /// This is the harness entry point; core components receive the
    /// resulting value and never consult the environment themselves.
    #[must_use]
    pub fn from_env() -> Self {
        let api_key = std::env::var("OLLAMA_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let base_url = match std::env::var("OLLAMA_HOST") {
            Ok(host) if !host.is_empty() => host.trim_end_matches('/').to_string(),
            _ if api_key.is_some() => DEFAULT_CLOUD_BASE_URL.to_string(),
            _ => DEFAULT_LOCAL_BASE_URL.to_string(),
        };

        Self {
            base_url,
            api_key,
            model: std::env::var("OLLAMA_MODEL").ok().filter(|m| !m.is_empty()),
            num_ctx: None,
            think_mode: ThinkMode::Auto,
            keep_alive: std::env::var("OLLAMA_KEEP_ALIVE").ok(),
        }
    }

    /// Set the base URL, stripping any trailing slash.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the context-window override.
    #[must_use]
    pub fn with_num_ctx(mut self, num_ctx: u32) -> Self {
        self.num_ctx = Some(num_ctx);
        self
    }

    /// Set the thinking mode.
    #[must_use]
    pub fn with_think_mode(mut self, mode: ThinkMode) -> Self {
        self.think_mode = mode;
        self
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute workspace root. All filesystem operations resolve under it.
    pub workspace_root: PathBuf,
    /// Initial goal, if any.
    pub goal: Option<String>,
    /// LLM connection settings.
    pub llm: LlmConfig,
    /// Test mode: terminate after `max_cycles` successful cycles.
    pub test_mode: bool,
    /// Maximum cycles in test mode.
    pub max_cycles: u32,
    /// Extract shell commands from assistant markdown instead of using
    /// structured tool calls. Off by default; the structured path is the
    /// supported one.
    pub legacy_command_extraction: bool,
}

impl Config {
    /// Create a configuration for the given workspace root.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            goal: None,
            llm: LlmConfig::default(),
            test_mode: false,
            max_cycles: 1,
            legacy_command_extraction: false,
        }
    }

    /// Set the initial goal.
    #[must_use]
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Set the LLM configuration.
    #[must_use]
    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }

    /// Enable test mode with the given cycle cap.
    #[must_use]
    pub fn with_test_mode(mut self, max_cycles: u32) -> Self {
        self.test_mode = true;
        self.max_cycles = max_cycles;
        self
    }
}
