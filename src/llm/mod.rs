//! Ollama wire protocol types and the streaming chat client.
//!
//! This module defines the request/response types for the Ollama HTTP API
//! and the [`Client`] that drives it. Two message types exist on purpose:
//! [`ChatMessage`] is the in-memory form and carries the model's thinking
//! trace for the UI, while [`OutgoingMessage`] is the wire form and never
//! serialises thinking. The stream producer converts before send, so no
//! conversation emitted to the network can leak reasoning tokens back to
//! the model.
//!
//! # Example
//!
//! ```rust,ignore
//! use brewol::config::LlmConfig;
//! use brewol::llm::{ChatMessage, Client, Role};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = Client::new(LlmConfig::from_env());
//! let messages = vec![ChatMessage::text(Role::User, "hello")];
//! let mut rx = client.chat_stream(messages, None, CancellationToken::new())?;
//! while let Some(chunk) = rx.recv().await {
//!     print!("{}", chunk.response.message.content);
//! }
//! ```

mod client;

pub use client::Client;

use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

// =============================================================================
// Model context-size table
// =============================================================================

/// Known model context sizes (in tokens), used when no explicit override
/// is configured. Keys are lowercased base names without the `:tag` suffix.
const KNOWN_MODEL_CONTEXT_SIZES: &[(&str, u32)] = &[
    // Cloud models (typically 128k+)
    ("gemini", 1_048_576),
    ("gemini-2.0-flash", 1_048_576),
    ("gemini-2.5-flash", 1_048_576),
    ("gemini-3-flash", 1_048_576),
    ("gemini-3-flash-preview", 1_048_576),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4-turbo", 128_000),
    ("claude-3", 200_000),
    ("claude-3.5", 200_000),
    ("claude-3-opus", 200_000),
    ("claude-3-sonnet", 200_000),
    ("claude-3.5-sonnet", 200_000),
    ("claude-4-sonnet", 200_000),
    // Local Ollama models (common defaults)
    ("llama3", 8_192),
    ("llama3.1", 131_072),
    ("llama3.2", 131_072),
    ("llama3.3", 131_072),
    ("llama2", 4_096),
    ("mistral", 32_768),
    ("mixtral", 32_768),
    ("codellama", 16_384),
    ("deepseek", 65_536),
    ("deepseek-coder", 65_536),
    ("deepseek-r1", 131_072),
    ("qwen", 32_768),
    ("qwen2", 131_072),
    ("qwen2.5", 131_072),
    ("qwen3", 131_072),
    ("phi3", 131_072),
    ("phi4", 16_384),
    ("command-r", 131_072),
    ("command-r-plus", 131_072),
];

/// Fallback context size for unknown local models.
pub const DEFAULT_CONTEXT_SIZE: u32 = 8_192;

/// Fallback context size for unknown models carrying a `:cloud` tag.
pub const CLOUD_CONTEXT_SIZE: u32 = 131_072;

/// Look up the context-window size for a model name.
///
/// The `:tag` suffix is stripped and the base name lowercased. Exact
/// matches win; otherwise the longest matching prefix from the table is
/// used. Unknown models with a `:cloud` tag default to 128k, everything
/// else to 8k.
///
/// # Example
///
/// ```
/// use brewol::llm::lookup_model_context_size;
///
/// assert_eq!(lookup_model_context_size("llama3.1:8b"), 131_072);
/// assert_eq!(lookup_model_context_size("gemini-3-flash-preview"), 1_048_576);
/// assert_eq!(lookup_model_context_size("mystery:cloud"), 131_072);
/// assert_eq!(lookup_model_context_size("mystery"), 8_192);
/// ```
#[must_use]
pub fn lookup_model_context_size(model: &str) -> u32 {
    if model.is_empty() {
        return DEFAULT_CONTEXT_SIZE;
    }

    let base_name = match model.find(':') {
        Some(idx) if idx > 0 => &model[..idx],
        _ => model,
    };
    let base_name = base_name.to_lowercase();

    if let Some(&(_, size)) = KNOWN_MODEL_CONTEXT_SIZES
        .iter()
        .find(|(name, _)| *name == base_name)
    {
        return size;
    }

    // Longest prefix match, e.g. "qwen2.5-coder" matches "qwen2.5".
    if let Some(&(_, size)) = KNOWN_MODEL_CONTEXT_SIZES
        .iter()
        .filter(|(name, _)| base_name.starts_with(name))
        .max_by_key(|(name, _)| name.len())
    {
        return size;
    }

    if model.to_lowercase().contains(":cloud") {
        return CLOUD_CONTEXT_SIZE;
    }

    DEFAULT_CONTEXT_SIZE
}

// =============================================================================
// Messages
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// In-memory chat message.
///
/// Carries the thinking trace for display and logging. Thinking is a UI
/// artifact and is never sent back to the model; the wire form is
/// [`OutgoingMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Thinking trace (reasoning tokens). UI-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    /// Create a plain text message.
    #[must_use]
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: None,
            tool_calls: None,
        }
    }

    /// Convert to the wire form, dropping the thinking trace.
    #[must_use]
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Wire chat message. Has no thinking field by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Tool call produced by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolFunction,
}

/// Function details of a tool call. Arguments are an opaque JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

// =============================================================================
// Tool schema
// =============================================================================

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolDef,
}

/// Function body of a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    /// Wrap a function definition in the `{type: "function", ...}` record
    /// the chat API expects.
    #[must_use]
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// =============================================================================
// Think mode
// =============================================================================

/// Thinking-mode setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ThinkMode {
    /// Resolve per model: "medium" for gpt-oss, on for known thinking
    /// models, omitted otherwise.
    #[default]
    Auto,
    On,
    Off,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ThinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThinkMode::Auto => "auto",
            ThinkMode::On => "on",
            ThinkMode::Off => "off",
            ThinkMode::Low => "low",
            ThinkMode::Medium => "medium",
            ThinkMode::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Model name patterns that indicate thinking capability.
const THINKING_MODEL_PATTERNS: &[&str] =
    &["deepseek", "qwq", "gpt-oss", "thinking", "reason", "o1", "o3"];

/// Check whether a model name looks thinking-capable.
#[must_use]
pub fn is_thinking_capable(model: &str) -> bool {
    let lower = model.to_lowercase();
    THINKING_MODEL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// The `think` request field: a boolean or a level string on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinkValue {
    Bool(bool),
    Level(&'static str),
}

impl Serialize for ThinkValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ThinkValue::Bool(b) => serializer.serialize_bool(*b),
            ThinkValue::Level(level) => serializer.serialize_str(level),
        }
    }
}

/// Resolve a think mode against a model name into the wire value.
///
/// `auto` picks `"medium"` for gpt-oss models, `true` for other
/// thinking-capable models, and omits the field entirely otherwise.
#[must_use]
pub fn build_think_value(mode: ThinkMode, model: &str) -> Option<ThinkValue> {
    match mode {
        ThinkMode::Off => Some(ThinkValue::Bool(false)),
        ThinkMode::On => Some(ThinkValue::Bool(true)),
        ThinkMode::Low => Some(ThinkValue::Level("low")),
        ThinkMode::Medium => Some(ThinkValue::Level("medium")),
        ThinkMode::High => Some(ThinkValue::Level("high")),
        ThinkMode::Auto => {
            if model.to_lowercase().contains("gpt-oss") {
                Some(ThinkValue::Level("medium"))
            } else if is_thinking_capable(model) {
                Some(ThinkValue::Bool(true))
            } else {
                None
            }
        }
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// Model options for a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub num_ctx: u32,
}

/// Chat API request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<OutgoingMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<ThinkValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
}

/// Chat response chunk (streaming) or full response (non-streaming).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default = "default_message")]
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub total_duration: i64,
    #[serde(default)]
    pub load_duration: i64,
    #[serde(default)]
    pub prompt_eval_count: u32,
    #[serde(default)]
    pub prompt_eval_duration: i64,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: i64,
}

fn default_message() -> ChatMessage {
    ChatMessage::text(Role::Assistant, "")
}

impl Default for ChatMessage {
    fn default() -> Self {
        default_message()
    }
}

/// Information about an installed model, from `/api/tags`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub digest: String,
}

/// Response from `GET /api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

// =============================================================================
// Stream chunks and metrics
// =============================================================================

/// Token usage metrics captured from a terminal response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    /// Number of tokens in the prompt.
    pub prompt_eval_count: u32,
    /// Number of tokens generated.
    pub eval_count: u32,
    /// Time spent evaluating the prompt (ns).
    pub prompt_eval_duration: i64,
    /// Time spent generating (ns).
    pub eval_duration: i64,
    /// Total request time (ns).
    pub total_duration: i64,
    /// Observed tokens generated per second.
    pub tokens_per_sec: f64,
}

/// One chunk from the streaming response.
///
/// Consumers must check `error` per chunk: an error chunk does not poison
/// subsequent chunks, except for the terminal cancellation chunk.
#[derive(Debug, Default)]
pub struct StreamChunk {
    pub response: ChatResponse,
    pub error: Option<crate::error::BrewolError>,
    pub tokens_per_sec: f64,
    /// Final metrics, only set on the `done: true` chunk.
    pub metrics: Option<TokenMetrics>,
    /// Thinking tokens carried by this chunk.
    pub thinking_content: Option<String>,
    /// True while the model is in its thinking phase.
    pub is_thinking: bool,
}

impl StreamChunk {
    /// Build a terminal error chunk.
    #[must_use]
    pub fn from_error(error: crate::error::BrewolError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_size_exact_match() {
        assert_eq!(lookup_model_context_size("llama3"), 8_192);
        assert_eq!(lookup_model_context_size("deepseek-r1"), 131_072);
        assert_eq!(lookup_model_context_size("mistral"), 32_768);
    }

    #[test]
    fn test_context_size_strips_tag() {
        assert_eq!(lookup_model_context_size("llama3.1:70b"), 131_072);
        assert_eq!(lookup_model_context_size("codellama:13b-instruct"), 16_384);
    }

    #[test]
    fn test_context_size_longest_prefix() {
        // "qwen2.5-coder" should match "qwen2.5" (131k), not "qwen" (32k).
        assert_eq!(lookup_model_context_size("qwen2.5-coder"), 131_072);
        assert_eq!(lookup_model_context_size("gemini-3-flash-preview-exp"), 1_048_576);
    }

    #[test]
    fn test_context_size_cloud_tag_fallback() {
        assert_eq!(lookup_model_context_size("somemodel:cloud"), 131_072);
    }

    #[test]
    fn test_context_size_unknown_fallback() {
        assert_eq!(lookup_model_context_size("totally-unknown"), 8_192);
        assert_eq!(lookup_model_context_size(""), 8_192);
    }

    #[test]
    fn test_outgoing_message_has_no_thinking() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: "answer".into(),
            thinking: Some("chain of thought".into()),
            tool_calls: None,
        };
        let wire = serde_json::to_string(&msg.to_outgoing()).unwrap();
        assert!(!wire.contains("thinking"));
        assert!(!wire.contains("chain of thought"));
        assert!(wire.contains("answer"));
    }

    #[test]
    fn test_outgoing_message_preserves_tool_calls() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            thinking: None,
            tool_calls: Some(vec![ToolCall {
                function: ToolFunction {
                    name: "fs_read".into(),
                    arguments: serde_json::json!({"path": "src/main.rs"}),
                },
            }]),
        };
        let wire = serde_json::to_string(&msg.to_outgoing()).unwrap();
        assert!(wire.contains("fs_read"));
    }

    #[test]
    fn test_think_value_serialization() {
        assert_eq!(serde_json::to_string(&ThinkValue::Bool(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&ThinkValue::Bool(false)).unwrap(), "false");
        assert_eq!(
            serde_json::to_string(&ThinkValue::Level("medium")).unwrap(),
            "\"medium\""
        );
    }

    #[test]
    fn test_build_think_value_explicit_modes() {
        assert_eq!(build_think_value(ThinkMode::On, "llama3"), Some(ThinkValue::Bool(true)));
        assert_eq!(build_think_value(ThinkMode::Off, "llama3"), Some(ThinkValue::Bool(false)));
        assert_eq!(
            build_think_value(ThinkMode::Low, "llama3"),
            Some(ThinkValue::Level("low"))
        );
        assert_eq!(
            build_think_value(ThinkMode::High, "llama3"),
            Some(ThinkValue::Level("high"))
        );
    }

    #[test]
    fn test_build_think_value_auto_gpt_oss() {
        assert_eq!(
            build_think_value(ThinkMode::Auto, "gpt-oss:20b"),
            Some(ThinkValue::Level("medium"))
        );
    }

    #[test]
    fn test_build_think_value_auto_thinking_capable() {
        assert_eq!(
            build_think_value(ThinkMode::Auto, "deepseek-r1"),
            Some(ThinkValue::Bool(true))
        );
        assert_eq!(
            build_think_value(ThinkMode::Auto, "QwQ:32b"),
            Some(ThinkValue::Bool(true))
        );
    }

    #[test]
    fn test_build_think_value_auto_plain_model_omits() {
        assert_eq!(build_think_value(ThinkMode::Auto, "llama3.1"), None);
        assert_eq!(build_think_value(ThinkMode::Auto, "codellama"), None);
    }

    #[test]
    fn test_is_thinking_capable() {
        assert!(is_thinking_capable("deepseek-coder-v2"));
        assert!(is_thinking_capable("my-reasoning-model"));
        assert!(is_thinking_capable("o3-mini"));
        assert!(!is_thinking_capable("llama3.2"));
    }

    #[test]
    fn test_chat_request_omits_empty_fields() {
        let req = ChatRequest {
            model: "llama3".into(),
            messages: vec![],
            stream: true,
            options: None,
            think: None,
            tools: None,
        };
        let body = serde_json::to_string(&req).unwrap();
        assert!(!body.contains("options"));
        assert!(!body.contains("think"));
        assert!(!body.contains("tools"));
    }

    #[test]
    fn test_chat_request_serializes_think_bool() {
        let req = ChatRequest {
            model: "deepseek-r1".into(),
            messages: vec![],
            stream: true,
            options: None,
            think: build_think_value(ThinkMode::Auto, "deepseek-r1"),
            tools: None,
        };
        let body = serde_json::to_string(&req).unwrap();
        assert!(body.contains("\"think\":true"));
    }

    #[test]
    fn test_chat_response_decodes_minimal_chunk() {
        let line = r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#;
        let resp: ChatResponse = serde_json::from_str(line).unwrap();
        assert_eq!(resp.message.content, "Hi");
        assert!(!resp.done);
    }

    #[test]
    fn test_chat_response_decodes_terminal_metrics() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":true,
            "prompt_eval_count":120,"eval_count":45,"total_duration":900000000}"#;
        let resp: ChatResponse = serde_json::from_str(line).unwrap();
        assert!(resp.done);
        assert_eq!(resp.prompt_eval_count, 120);
        assert_eq!(resp.eval_count, 45);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::System.to_string(), "system");
        assert_eq!(Role::Tool.to_string(), "tool");
    }
}
