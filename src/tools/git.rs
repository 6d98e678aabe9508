//! Git tools and repository helpers.
//!
//! All git tools run the system `git` binary with a non-interactive
//! environment. `git_commit` stages everything first and forces a
//! non-interactive editor; `git_reset_hard` exists for recovery only.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{truncate_output, Tool, ToolContext, ToolResult, MAX_DIFF_OUTPUT};

/// Run `git` with the given args, merging stdout and stderr.
async fn run_git(root: &Path, args: &[&str], extra_env: &[(&str, &str)]) -> (String, i32, Option<String>) {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(root)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    for (key, value) in extra_env {
        cmd.env(key, value);
    }

    match cmd.output().await {
        Ok(out) => {
            let exit_code = out.status.code().unwrap_or(-1);
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&stderr);
            }
            (output, exit_code, None)
        }
        Err(e) => (String::new(), -1, Some(e.to_string())),
    }
}

fn git_result(name: &str, output: String, exit_code: i32, error: Option<String>, start: Instant) -> ToolResult {
    ToolResult {
        name: name.to_string(),
        output,
        error,
        duration_seconds: start.elapsed().as_secs_f64(),
        exit_code,
    }
}

// =============================================================================
// git_status
// =============================================================================

/// Reports repository status in porcelain v2 format.
pub struct GitStatus;

#[async_trait]
impl Tool for GitStatus {
    fn name(&self) -> &'static str {
        "git_status"
    }

    fn description(&self) -> &'static str {
        "Get the current git status including branch, staged/unstaged changes, and untracked files."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> ToolResult {
        let start = Instant::now();
        let (output, exit_code, error) = run_git(
            &ctx.workspace_root,
            &["status", "--porcelain=v2", "--branch"],
            &[],
        )
        .await;
        git_result(self.name(), output, exit_code, error, start)
    }
}

// =============================================================================
// git_diff
// =============================================================================

/// Shows stat + patch output, optionally staged or against a ref.
pub struct GitDiff;

#[derive(Deserialize)]
struct GitDiffArgs {
    #[serde(default)]
    staged: bool,
    #[serde(default)]
    r#ref: String,
}

#[async_trait]
impl Tool for GitDiff {
    fn name(&self) -> &'static str {
        "git_diff"
    }

    fn description(&self) -> &'static str {
        "Get git diff. Can show staged changes, unstaged changes, or diff against a specific ref."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "staged": {
                    "type": "boolean",
                    "description": "Show staged changes only",
                    "default": false
                },
                "ref": {
                    "type": "string",
                    "description": "Compare against a specific ref (branch, commit, tag)",
                    "default": ""
                }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: GitDiffArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };

        let mut cmd_args = vec!["diff", "--stat", "--patch"];
        if a.staged {
            cmd_args.push("--staged");
        }
        if !a.r#ref.is_empty() {
            cmd_args.push(&a.r#ref);
        }

        let (mut output, exit_code, error) = run_git(&ctx.workspace_root, &cmd_args, &[]).await;
        if output.is_empty() && error.is_none() {
            output = "No changes".to_string();
        }
        let output = truncate_output(output, MAX_DIFF_OUTPUT);
        git_result(self.name(), output, exit_code, error, start)
    }
}

// =============================================================================
// git_checkout / git_create_branch
// =============================================================================

/// Checks out a branch, tag, or commit.
pub struct GitCheckout;

#[derive(Deserialize)]
struct GitCheckoutArgs {
    r#ref: String,
}

#[async_trait]
impl Tool for GitCheckout {
    fn name(&self) -> &'static str {
        "git_checkout"
    }

    fn description(&self) -> &'static str {
        "Checkout a branch, tag, or commit."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ref": {
                    "type": "string",
                    "description": "Branch, tag, or commit to checkout"
                }
            },
            "required": ["ref"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: GitCheckoutArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };
        let (output, exit_code, error) =
            run_git(&ctx.workspace_root, &["checkout", &a.r#ref], &[]).await;
        git_result(self.name(), output, exit_code, error, start)
    }
}

/// Creates and checks out a new branch.
pub struct GitCreateBranch;

#[derive(Deserialize)]
struct GitCreateBranchArgs {
    name: String,
}

#[async_trait]
impl Tool for GitCreateBranch {
    fn name(&self) -> &'static str {
        "git_create_branch"
    }

    fn description(&self) -> &'static str {
        "Create and checkout a new branch."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Name for the new branch"
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: GitCreateBranchArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };
        let (output, exit_code, error) =
            run_git(&ctx.workspace_root, &["checkout", "-b", &a.name], &[]).await;
        git_result(self.name(), output, exit_code, error, start)
    }
}

// =============================================================================
// git_commit
// =============================================================================

/// Stages all changes and commits.
pub struct GitCommit;

#[derive(Deserialize)]
struct GitCommitArgs {
    message: String,
}

#[async_trait]
impl Tool for GitCommit {
    fn name(&self) -> &'static str {
        "git_commit"
    }

    fn description(&self) -> &'static str {
        "Stage all changes and create a commit with the given message."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Commit message"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: GitCommitArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };

        let (add_output, add_code, add_error) =
            run_git(&ctx.workspace_root, &["add", "-A"], &[]).await;
        if add_code != 0 || add_error.is_some() {
            return git_result(
                self.name(),
                format!("Failed to stage changes: {add_output}"),
                add_code,
                add_error.or(Some("git add failed".to_string())),
                start,
            );
        }

        let (output, exit_code, error) = run_git(
            &ctx.workspace_root,
            &["commit", "-m", &a.message],
            &[("GIT_EDITOR", "true")],
        )
        .await;
        git_result(self.name(), output, exit_code, error, start)
    }
}

// =============================================================================
// git_reset_hard
// =============================================================================

/// Performs a hard reset. Recovery only.
pub struct GitResetHard;

#[derive(Deserialize)]
struct GitResetHardArgs {
    r#ref: String,
}

#[async_trait]
impl Tool for GitResetHard {
    fn name(&self) -> &'static str {
        "git_reset_hard"
    }

    fn description(&self) -> &'static str {
        "Perform a hard reset to a specific ref. WARNING: This discards uncommitted changes. Use only for recovery."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ref": {
                    "type": "string",
                    "description": "Ref to reset to (branch, tag, commit SHA)"
                }
            },
            "required": ["ref"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: GitResetHardArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };
        let (output, exit_code, error) =
            run_git(&ctx.workspace_root, &["reset", "--hard", &a.r#ref], &[]).await;
        git_result(self.name(), output, exit_code, error, start)
    }
}

// =============================================================================
// Synchronous helpers
// =============================================================================

fn run_git_sync(root: &Path, args: &[&str]) -> Option<String> {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(root)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Current branch name, or empty when not in a repository.
#[must_use]
pub fn current_branch(root: &Path) -> String {
    run_git_sync(root, &["rev-parse", "--abbrev-ref", "HEAD"])
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Check whether the directory is inside a git repository.
#[must_use]
pub fn is_git_repo(root: &Path) -> bool {
    run_git_sync(root, &["rev-parse", "--git-dir"]).is_some()
}

/// Modified and untracked files from porcelain status.
#[must_use]
pub fn dirty_files(root: &Path) -> Vec<String> {
    run_git_sync(root, &["status", "--porcelain"])
        .map(|output| {
            output
                .lines()
                .filter(|line| line.len() > 3)
                .map(|line| line[3..].trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Short SHA of HEAD, or empty when unavailable.
#[must_use]
pub fn head_commit(root: &Path) -> String {
    run_git_sync(root, &["rev-parse", "--short", "HEAD"])
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: &TempDir) -> ToolContext {
        ToolContext::new(dir.path()).with_cancel(CancellationToken::new())
    }

    fn init_repo(dir: &TempDir) {
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .expect("git runs");
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
    }

    #[test]
    fn test_is_git_repo() {
        let dir = TempDir::new().unwrap();
        assert!(!is_git_repo(dir.path()));
        init_repo(&dir);
        assert!(is_git_repo(dir.path()));
    }

    #[test]
    fn test_dirty_files() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        assert!(dirty_files(dir.path()).is_empty());

        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        let dirty = dirty_files(dir.path());
        assert_eq!(dirty, vec!["new.txt"]);
    }

    #[tokio::test]
    async fn test_git_status_porcelain() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let result = GitStatus.execute(&ctx(&dir), json!({})).await;
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("# branch"));
        assert!(result.output.contains("a.txt"));
    }

    #[tokio::test]
    async fn test_git_commit_stages_all() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        std::fs::write(dir.path().join("a.txt"), "content").unwrap();

        let result = GitCommit
            .execute(&ctx(&dir), json!({"message": "add a.txt"}))
            .await;
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert!(dirty_files(dir.path()).is_empty());
        assert!(!head_commit(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_git_create_branch_and_current_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        GitCommit
            .execute(&ctx(&dir), json!({"message": "init"}))
            .await;

        let result = GitCreateBranch
            .execute(&ctx(&dir), json!({"name": "agent/20250101-000000"}))
            .await;
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert_eq!(current_branch(dir.path()), "agent/20250101-000000");
    }

    #[tokio::test]
    async fn test_git_diff_no_changes() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        GitCommit
            .execute(&ctx(&dir), json!({"message": "init"}))
            .await;

        let result = GitDiff.execute(&ctx(&dir), json!({})).await;
        assert_eq!(result.output, "No changes");
    }

    #[tokio::test]
    async fn test_git_diff_shows_patch() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        std::fs::write(dir.path().join("a.txt"), "before\n").unwrap();
        GitCommit
            .execute(&ctx(&dir), json!({"message": "init"}))
            .await;
        std::fs::write(dir.path().join("a.txt"), "after\n").unwrap();

        let result = GitDiff.execute(&ctx(&dir), json!({})).await;
        assert!(result.output.contains("-before"));
        assert!(result.output.contains("+after"));
    }

    #[tokio::test]
    async fn test_git_reset_hard_discards_changes() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        std::fs::write(dir.path().join("a.txt"), "committed\n").unwrap();
        GitCommit
            .execute(&ctx(&dir), json!({"message": "init"}))
            .await;
        std::fs::write(dir.path().join("a.txt"), "dirty\n").unwrap();

        let result = GitResetHard
            .execute(&ctx(&dir), json!({"ref": "HEAD"}))
            .await;
        assert_eq!(result.exit_code, 0, "{}", result.output);
        let content = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "committed\n");
    }

    #[tokio::test]
    async fn test_git_checkout_unknown_ref_fails() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir);
        let result = GitCheckout
            .execute(&ctx(&dir), json!({"ref": "does-not-exist"}))
            .await;
        assert_ne!(result.exit_code, 0);
    }
}
