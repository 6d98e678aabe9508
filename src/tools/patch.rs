//! Unified-diff patch tool: `fs_patch`.
//!
//! Hunks are applied by literal context matching rather than line offsets,
//! so patches survive small drift in the target file. A diff with no
//! removals against a missing file creates it.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{path_guard, Tool, ToolContext, ToolResult};
use crate::error::{BrewolError, Result};

/// Applies a unified diff to files in the workspace.
pub struct FsPatch;

#[derive(Deserialize)]
struct FsPatchArgs {
    diff: String,
}

#[async_trait]
impl Tool for FsPatch {
    fn name(&self) -> &'static str {
        "fs_patch"
    }

    fn description(&self) -> &'static str {
        "Apply a unified diff patch to files. Preferred for modifying existing files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "diff": {
                    "type": "string",
                    "description": "Unified diff to apply"
                }
            },
            "required": ["diff"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: FsPatchArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };

        match apply_unified_diff(&ctx.workspace_root, &a.diff) {
            Ok(message) => ToolResult {
                name: self.name().to_string(),
                output: message,
                duration_seconds: start.elapsed().as_secs_f64(),
                ..ToolResult::default()
            },
            Err(e) => ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        }
    }
}

/// A parsed hunk: its context/removal/addition lines in order.
#[derive(Debug, Default)]
struct Hunk {
    context: Vec<String>,
    removals: Vec<String>,
    additions: Vec<String>,
}

/// Extract the target file paths from `+++ b/<path>` headers.
#[must_use]
pub fn target_files(diff: &str) -> Vec<String> {
    diff.lines()
        .filter(|line| line.starts_with("+++ "))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|path| path.strip_prefix("b/").unwrap_or(path).to_string())
        .collect()
}

/// Parse and apply a unified diff rooted at `root`.
pub fn apply_unified_diff(root: &Path, diff: &str) -> Result<String> {
    let mut target_file: Option<String> = None;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in diff.lines() {
        if line.starts_with("--- ") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(path) = rest.split_whitespace().next() {
                target_file = Some(path.strip_prefix("b/").unwrap_or(path).to_string());
            }
            continue;
        }
        if line.starts_with("@@") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            current = Some(Hunk::default());
            continue;
        }
        if let Some(hunk) = current.as_mut() {
            if line.is_empty() {
                hunk.context.push(String::new());
                continue;
            }
            match line.as_bytes()[0] {
                b' ' => hunk.context.push(line[1..].to_string()),
                b'+' => hunk.additions.push(line[1..].to_string()),
                b'-' => hunk.removals.push(line[1..].to_string()),
                _ => {}
            }
        }
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }

    let target_file = target_file.ok_or_else(|| BrewolError::Patch {
        message: "could not parse target file from diff".to_string(),
    })?;

    let target_path = path_guard::resolve(root, &target_file)?;

    let existing = match std::fs::read_to_string(&target_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(BrewolError::Patch {
                message: format!("failed to read file: {e}"),
            })
        }
    };

    let mut content = existing;
    for hunk in &hunks {
        content = apply_hunk(&content, hunk)?;
    }

    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target_path, &content)?;

    Ok(format!("Applied patch to {target_file}"))
}

/// Apply one hunk by locating its removal (or context) block literally.
fn apply_hunk(content: &str, hunk: &Hunk) -> Result<String> {
    let content_lines: Vec<&str> = content.split('\n').collect();

    let search: &[String] = if hunk.removals.is_empty() {
        &hunk.context
    } else {
        &hunk.removals
    };

    if search.is_empty() {
        // Pure addition with no anchor: append.
        let mut result: Vec<String> = content_lines.iter().map(|s| s.to_string()).collect();
        result.extend(hunk.additions.iter().cloned());
        return Ok(result.join("\n"));
    }

    for i in 0..=content_lines.len().saturating_sub(search.len()) {
        let matches = search
            .iter()
            .enumerate()
            .all(|(j, line)| content_lines.get(i + j).copied() == Some(line.as_str()));
        if matches {
            let mut result: Vec<String> =
                content_lines[..i].iter().map(|s| s.to_string()).collect();
            result.extend(hunk.additions.iter().cloned());
            result.extend(
                content_lines[i + hunk.removals.len()..]
                    .iter()
                    .map(|s| s.to_string()),
            );
            return Ok(result.join("\n"));
        }
    }

    if hunk.removals.is_empty() {
        // Context not found but nothing to remove: append additions.
        let mut result: Vec<String> = content_lines.iter().map(|s| s.to_string()).collect();
        result.extend(hunk.additions.iter().cloned());
        return Ok(result.join("\n"));
    }

    Err(BrewolError::Patch {
        message: "could not find context to apply hunk".to_string(),
    })
}
