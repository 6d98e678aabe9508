//! Custom error types for brewol.
//!
//! This module provides structured error types that enable better
//! error handling, classification, and recovery throughout the agent.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for brewol operations
#[derive(Error, Debug)]
pub enum BrewolError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load or validate configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Workspace directory missing or invalid
    #[error("Workspace error: {path}: {message}")]
    Workspace { path: PathBuf, message: String },

    /// No model has been selected
    #[error("no model selected; use SetModel() or set OLLAMA_MODEL")]
    NoModel,

    // =========================================================================
    // LLM Transport Errors
    // =========================================================================
    /// HTTP-level failure talking to the model runtime
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// Request could not be sent or the stream broke mid-flight
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Request body exceeded the wire limit
    #[error("request too large ({size} bytes), reduce context")]
    RequestTooLarge { size: usize },

    /// A streamed chunk could not be decoded
    #[error("failed to decode chunk: {message}")]
    Decode { message: String },

    /// The in-flight operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Tool Errors
    // =========================================================================
    /// Requested tool is not registered
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    /// Tool arguments failed to parse
    #[error("Tool '{tool}' received invalid arguments: {message}")]
    ToolArgs { tool: String, message: String },

    /// Tool execution failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Path escapes the workspace root
    #[error("path traversal blocked: {path} resolves outside workspace root")]
    PathEscape { path: String },

    /// Child process exceeded its timeout
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Patch could not be applied
    #[error("Patch error: {message}")]
    Patch { message: String },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Task store lookup failed
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Persistent store operation failed
    #[error("Store error: {message}")]
    Store { message: String },

    /// Session log was already closed
    #[error("session is closed")]
    SessionClosed,

    /// Instruction file outside allowed locations
    #[error("path must be within workspace ({workspace}) or user config ({config})")]
    InstructionPath { workspace: String, config: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// A cycle phase failed
    #[error("{phase} failed: {message}")]
    Cycle { phase: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrewolError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a tool execution error
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a cycle phase error
    pub fn cycle(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cycle {
            phase: phase.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if the error text indicates a rate limit or quota problem.
    ///
    /// Matching is a case-sensitive substring scan over the rendered
    /// message, so HTTP status codes folded into `Api` errors ("429")
    /// classify the same way as provider text ("rate limit exceeded").
    pub fn is_rate_limit(&self) -> bool {
        let text = self.to_string();
        ["403", "429", "limit", "quota", "rate"]
            .iter()
            .any(|needle| text.contains(needle))
    }

    /// Check if this error is expected cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error should count toward the consecutive-error
    /// threshold (transport and cycle failures do; cancellation and
    /// rate limits have their own recovery paths)
    pub fn is_recoverable(&self) -> bool {
        !self.is_cancellation() && !self.is_rate_limit()
    }

    /// Check if this error is fatal to the operation that raised it but
    /// not to the loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoModel | Self::Workspace { .. } | Self::PathEscape { .. }
        )
    }
}

/// Type alias for brewol results
pub type Result<T> = std::result::Result<T, BrewolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrewolError::Api {
            status: 429,
            body: "too many requests".to_string(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("too many requests"));
    }

    #[test]
    fn test_no_model_literal() {
        assert_eq!(
            BrewolError::NoModel.to_string(),
            "no model selected; use SetModel() or set OLLAMA_MODEL"
        );
    }

    #[test]
    fn test_is_rate_limit() {
        assert!(BrewolError::Api {
            status: 429,
            body: "slow down".into()
        }
        .is_rate_limit());
        assert!(BrewolError::transport("monthly quota exhausted").is_rate_limit());
        assert!(BrewolError::transport("rate limited by upstream").is_rate_limit());
        assert!(!BrewolError::transport("connection refused").is_rate_limit());
    }

    #[test]
    fn test_rate_limit_is_case_sensitive() {
        assert!(!BrewolError::transport("RATE EXCEEDED").is_rate_limit());
    }

    #[test]
    fn test_is_cancellation() {
        assert!(BrewolError::Cancelled.is_cancellation());
        assert!(!BrewolError::transport("boom").is_cancellation());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(BrewolError::transport("socket closed").is_recoverable());
        assert!(!BrewolError::Cancelled.is_recoverable());
        assert!(!BrewolError::Api {
            status: 429,
            body: String::new()
        }
        .is_recoverable());
    }

    #[test]
    fn test_is_fatal() {
        assert!(BrewolError::NoModel.is_fatal());
        assert!(BrewolError::PathEscape {
            path: "../etc".into()
        }
        .is_fatal());
        assert!(!BrewolError::transport("x").is_fatal());
    }

    #[test]
    fn test_constructor_helpers() {
        let err = BrewolError::git("commit", "nothing to commit");
        if let BrewolError::Git { operation, message } = err {
            assert_eq!(operation, "commit");
            assert_eq!(message, "nothing to commit");
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: BrewolError = io_err.into();
        assert!(matches!(err, BrewolError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
