//! brewol - autonomous terminal coding agent
//!
//! An always-on agent that drives a local Ollama runtime through a
//! continuous observe -> decide -> act -> verify -> checkpoint loop
//! against a developer workspace. It streams model output token by
//! token, executes the tool calls the model emits, measures context
//! pressure, compacts history when it rises, and persists durable
//! working memory so successive prompts stay small yet informed.
//!
//! # Architecture
//!
//! - [`engine`] - the cycle state machine orchestrating everything
//! - [`llm`] - Ollama wire protocol client with streaming and thinking
//!   separation
//! - [`tools`] - registry of filesystem/search/shell/git tools with
//!   workspace path containment
//! - [`context`] - token budget, compaction, task store, and task briefs
//! - [`prompt`] - layered instruction prompts with secret redaction
//! - [`memory`] - durable rolling memory across sessions
//! - [`logs`] - append-only JSONL session logs
//! - [`repo`] - project detection and the verification runner
//!
//! # Example
//!
//! ```rust,ignore
//! use brewol::config::{Config, LlmConfig};
//! use brewol::engine::Engine;
//!
//! let config = Config::new("/path/to/workspace")
//!     .with_goal("Fix all failing tests")
//!     .with_llm(LlmConfig::from_env());
//!
//! let engine = Engine::new(config)?;
//! let (handle, mut updates) = engine.spawn();
//!
//! while let Some(update) = updates.recv().await {
//!     println!("{update:?}");
//! }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod llm;
pub mod logs;
pub mod memory;
pub mod prompt;
pub mod repo;
pub mod tools;

// Re-export commonly used types
pub use error::{BrewolError, Result};

// Re-export config types
pub use config::{Config, LlmConfig};

// Re-export engine types
pub use engine::{
    BacklogItem, CycleUpdate, Engine, EngineHandle, EngineState, Suggestion, SuggestionStatus,
    Summary,
};

// Re-export LLM types
pub use llm::{
    ChatMessage, Client, ModelInfo, Role, StreamChunk, ThinkMode, TokenMetrics, ToolCall,
};

// Re-export tool types
pub use tools::{Registry, Tool, ToolContext, ToolResult};

// Re-export context types
pub use context::budget::{BudgetManager, BudgetState, CompactionEvent};
pub use context::compactor::Compactor;
pub use context::taskstore::{Task, TaskCategory, TaskPriority, TaskStatus, TaskStore};

// Re-export repo types
pub use repo::{detect_project, Project, ProjectType, Verifier};
