//! Tool registry and built-in tool implementations.
//!
//! Tools are the agent's hands: filesystem access, code search, shell
//! execution, and version control. Each tool describes itself with a JSON
//! schema and executes against arguments the model produced. The
//! [`Registry`] dispatches by name and enforces workspace containment via
//! [`path_guard`].
//!
//! # Architecture
//!
//! The [`Tool`] trait is object-safe and all implementations are
//! `Send + Sync`, so the registry holds `Arc<dyn Tool>` handles.
//! `execute` never returns both a result and a transport error: argument
//! and execution failures are carried inside [`ToolResult::error`] whenever
//! a result can be formed, and only dispatch-level failures (unknown tool)
//! surface as `Err`.

pub mod exec;
pub mod fs;
pub mod git;
pub mod patch;
pub mod path_guard;
pub mod search;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{BrewolError, Result};
use crate::llm::ToolSchema;

/// Directories skipped by walking tools.
pub(crate) const SKIP_DIRS: &[&str] = &[".git", "node_modules", "vendor", "__pycache__"];

/// Output cap for shell-class tools.
pub(crate) const MAX_SHELL_OUTPUT: usize = 50_000;

/// Output cap for diff tools.
pub(crate) const MAX_DIFF_OUTPUT: usize = 30_000;

/// Suffix appended when output is truncated.
pub(crate) const TRUNCATION_MARKER: &str = "\n... (output truncated)";

/// Cap a string at `max` bytes, appending the truncation marker.
pub(crate) fn truncate_output(mut output: String, max: usize) -> String {
    if output.len() > max {
        // Back up to a char boundary so the cut is valid UTF-8.
        let mut cut = max;
        while cut > 0 && !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str(TRUNCATION_MARKER);
    }
    output
}

/// Result of a tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Tool name.
    pub name: String,
    /// Bounded output text.
    pub output: String,
    /// Execution error, if the tool itself failed.
    pub error: Option<String>,
    /// Wall-clock duration in seconds.
    pub duration_seconds: f64,
    /// Exit code for process-backed tools (0 otherwise).
    pub exit_code: i32,
}

impl ToolResult {
    /// Build a failed result carrying the error text.
    #[must_use]
    pub fn failed(name: impl Into<String>, error: impl ToString, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            error: Some(error.to_string()),
            duration_seconds,
            ..Self::default()
        }
    }

    /// Check whether the execution succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }
}

/// Execution context shared by all tools for one dispatch.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace root all paths resolve under.
    pub workspace_root: PathBuf,
    /// Cancellation signal for long-running executions.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Create a context for the given workspace.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context carrying the given cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Interface every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, used for dispatch and in model schemas.
    fn name(&self) -> &'static str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &'static str;

    /// JSON schema of the tool's parameters.
    fn parameters(&self) -> Value;

    /// Execute with the given opaque JSON arguments.
    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult;
}

/// Name-indexed tool dispatch table.
///
/// Construction registers the fixed built-in set. Additional tools can be
/// registered before the engine starts.
pub struct Registry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
    workspace_root: PathBuf,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.list())
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

impl Registry {
    /// Create a registry with the built-in tools for a workspace.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let mut registry = Self {
            tools: BTreeMap::new(),
            workspace_root,
        };

        registry.register(Arc::new(fs::FsList));
        registry.register(Arc::new(fs::FsRead));
        registry.register(Arc::new(fs::FsWrite));
        registry.register(Arc::new(patch::FsPatch));
        registry.register(Arc::new(search::RgSearch));
        registry.register(Arc::new(exec::Exec::default()));
        registry.register(Arc::new(exec::Exec::shell_alias()));
        registry.register(Arc::new(git::GitStatus));
        registry.register(Arc::new(git::GitDiff));
        registry.register(Arc::new(git::GitCheckout));
        registry.register(Arc::new(git::GitCreateBranch));
        registry.register(Arc::new(git::GitCommit));
        registry.register(Arc::new(git::GitResetHard));

        registry
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names.
    #[must_use]
    pub fn list(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// The workspace root paths resolve under.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Execute a tool by name.
    ///
    /// Returns `Err` only for unknown tools; every other failure is
    /// reported inside the returned [`ToolResult`].
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult> {
        let tool = self.get(name).ok_or_else(|| BrewolError::UnknownTool {
            name: name.to_string(),
        })?;

        let ctx = ToolContext::new(&self.workspace_root).with_cancel(cancel);
        debug!(tool = name, "dispatching tool");
        Ok(tool.execute(&ctx, args).await)
    }

    /// Execute with post-edit QA: after `fs_write` or `fs_patch`, re-read
    /// the modified files and append read-back evidence plus a bounded git
    /// diff snippet so the model can confirm its edit landed.
    pub async fn execute_with_qa(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult> {
        let modified = if name == "fs_write" || name == "fs_patch" {
            modified_files(name, &args)
        } else {
            Vec::new()
        };

        let mut result = self.execute(name, args, cancel.clone()).await?;
        if result.error.is_some() || modified.is_empty() {
            return Ok(result);
        }

        for file in &modified {
            let abs = match path_guard::resolve(&self.workspace_root, file) {
                Ok(p) => p,
                Err(e) => {
                    result.error = Some(e.to_string());
                    return Ok(result);
                }
            };
            match std::fs::read_to_string(&abs) {
                Ok(content) => {
                    if !result.output.is_empty() {
                        result.output.push_str("\n\n");
                    }
                    result.output.push_str(&format!(
                        "--- POST-EDIT VERIFICATION ---\nFile: {}\nSize: {} bytes\nFirst 500 chars:\n{}\n",
                        file,
                        content.len(),
                        head_chars(&content, 500)
                    ));
                }
                Err(e) => {
                    result.error = Some(format!("failed to read back {file}: {e}"));
                    return Ok(result);
                }
            }
        }

        if git::is_git_repo(&self.workspace_root) {
            if let Ok(diff) = self
                .execute("git_diff", serde_json::json!({"staged": false}), cancel)
                .await
            {
                if !diff.output.is_empty() && diff.output != "No changes" {
                    result.output.push_str("\nChanged:\n");
                    result.output.push_str(&head_chars(&diff.output, 1000));
                }
            }
        }

        result.output = truncate_output(result.output, MAX_SHELL_OUTPUT);
        Ok(result)
    }

    /// Convert registered tools to the model's function-schema format.
    #[must_use]
    pub fn to_model_schema(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema::function(tool.name(), tool.description(), tool.parameters()))
            .collect()
    }
}

/// Files a write-class tool will modify, extracted from its arguments.
fn modified_files(name: &str, args: &Value) -> Vec<String> {
    match name {
        "fs_write" => args
            .get("path")
            .and_then(Value::as_str)
            .map(|p| vec![p.to_string()])
            .unwrap_or_default(),
        "fs_patch" => args
            .get("diff")
            .and_then(Value::as_str)
            .map(patch::target_files)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn head_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated]", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registry_builtin_set() {
        let registry = Registry::new("/tmp/ws");
        let names = registry.list();
        for expected in [
            "exec",
            "fs_list",
            "fs_patch",
            "fs_read",
            "fs_write",
            "git_checkout",
            "git_commit",
            "git_create_branch",
            "git_diff",
            "git_reset_hard",
            "git_status",
            "rg_search",
            "shell",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }

    #[test]
    fn test_to_model_schema_shape() {
        let registry = Registry::new("/tmp/ws");
        let schemas = registry.to_model_schema();
        assert_eq!(schemas.len(), registry.list().len());
        for schema in &schemas {
            assert_eq!(schema.kind, "function");
            assert!(!schema.function.name.is_empty());
            assert!(!schema.function.description.is_empty());
            assert_eq!(schema.function.parameters["type"], "object");
        }
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = Registry::new("/tmp/ws");
        let err = registry
            .execute("no_such_tool", Value::Null, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrewolError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_execute_never_returns_result_and_error() {
        // A failing tool still comes back as Ok(result-with-error).
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path());
        let result = registry
            .execute(
                "fs_read",
                serde_json::json!({"path": "missing.txt"}),
                CancellationToken::new(),
            )
            .await
            .expect("dispatch succeeds");
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_execute_with_qa_appends_readback() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path());
        let result = registry
            .execute_with_qa(
                "fs_write",
                serde_json::json!({"path": "hello.txt", "content": "hello world"}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.error.is_none());
        assert!(result.output.contains("POST-EDIT VERIFICATION"));
        assert!(result.output.contains("hello world"));
    }

    #[test]
    fn test_truncate_output() {
        let long = "a".repeat(MAX_SHELL_OUTPUT + 10);
        let capped = truncate_output(long, MAX_SHELL_OUTPUT);
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert!(capped.len() <= MAX_SHELL_OUTPUT + TRUNCATION_MARKER.len());

        let short = truncate_output("fine".to_string(), MAX_SHELL_OUTPUT);
        assert_eq!(short, "fine");
    }

    #[test]
    fn test_tool_result_is_success() {
        let ok = ToolResult {
            name: "x".into(),
            ..ToolResult::default()
        };
        assert!(ok.is_success());

        let failed = ToolResult::failed("x", "boom", 0.1);
        assert!(!failed.is_success());

        let nonzero = ToolResult {
            exit_code: 2,
            ..ToolResult::default()
        };
        assert!(!nonzero.is_success());
    }
}
