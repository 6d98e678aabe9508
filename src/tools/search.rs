//! Code search tool: `rg_search`.
//!
//! Shells out to ripgrep when it is on the PATH; otherwise falls back to
//! a pure-Rust regex walker with the same directory skip rules.

use std::time::Instant;

use async_trait::async_trait;
use globset::Glob;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use walkdir::WalkDir;

use super::{Tool, ToolContext, ToolResult, SKIP_DIRS};

/// Matched lines longer than this are truncated.
const MAX_LINE_CHARS: usize = 200;

/// Searches file contents by regex.
pub struct RgSearch;

#[derive(Deserialize)]
struct RgSearchArgs {
    query: String,
    #[serde(default)]
    glob: String,
    #[serde(default)]
    max_results: usize,
}

#[async_trait]
impl Tool for RgSearch {
    fn name(&self) -> &'static str {
        "rg_search"
    }

    fn description(&self) -> &'static str {
        "Search for patterns in files using ripgrep (rg). Falls back to a built-in searcher if rg is not available."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search pattern (regex supported)"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob pattern to filter files (e.g., '*.rs', '**/*.ts')",
                    "default": ""
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return",
                    "default": 100
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let mut a: RgSearchArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };
        if a.max_results == 0 {
            a.max_results = 100;
        }

        if which_rg().is_some() {
            return self.execute_rg(ctx, &a, start).await;
        }
        self.execute_fallback(ctx, &a, start)
    }
}

fn which_rg() -> Option<std::path::PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join("rg"))
        .find(|candidate| candidate.is_file())
}

impl RgSearch {
    async fn execute_rg(&self, ctx: &ToolContext, a: &RgSearchArgs, start: Instant) -> ToolResult {
        let mut cmd = Command::new("rg");
        cmd.arg("--line-number")
            .arg("--color=never")
            .arg("--no-heading")
            .arg(format!("--max-count={}", a.max_results));
        if !a.glob.is_empty() {
            cmd.arg("--glob").arg(&a.glob);
        }
        cmd.arg(&a.query)
            .arg(&ctx.workspace_root)
            .current_dir(&ctx.workspace_root)
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return ToolResult::failed(self.name(), "operation cancelled", start.elapsed().as_secs_f64());
            }
            output = cmd.output() => output,
        };

        match output {
            Ok(out) => {
                let exit_code = out.status.code().unwrap_or(-1);
                // rg exits 1 for no matches, which is not an error.
                if exit_code == 1 {
                    return ToolResult {
                        name: self.name().to_string(),
                        output: "No matches found".to_string(),
                        duration_seconds: start.elapsed().as_secs_f64(),
                        exit_code,
                        ..ToolResult::default()
                    };
                }
                ToolResult {
                    name: self.name().to_string(),
                    output: String::from_utf8_lossy(&out.stdout).into_owned(),
                    duration_seconds: start.elapsed().as_secs_f64(),
                    exit_code,
                    error: (exit_code > 1)
                        .then(|| String::from_utf8_lossy(&out.stderr).into_owned()),
                }
            }
            Err(e) => ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        }
    }

    fn execute_fallback(&self, ctx: &ToolContext, a: &RgSearchArgs, start: Instant) -> ToolResult {
        let pattern = match regex::Regex::new(&a.query) {
            Ok(p) => p,
            Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        };

        let glob_matcher = if a.glob.is_empty() {
            None
        } else {
            match Glob::new(&a.glob) {
                Ok(g) => Some(g.compile_matcher()),
                Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
            }
        };

        let mut output = String::new();
        let mut result_count = 0usize;

        let walker = WalkDir::new(&ctx.workspace_root).into_iter().filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
        });

        'files: for entry in walker.flatten() {
            if ctx.cancel.is_cancelled() {
                return ToolResult::failed(
                    self.name(),
                    "operation cancelled",
                    start.elapsed().as_secs_f64(),
                );
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(&ctx.workspace_root)
                .unwrap_or(entry.path());

            if let Some(matcher) = &glob_matcher {
                let name_match = matcher.is_match(entry.file_name().to_string_lossy().as_ref());
                if !name_match && !matcher.is_match(rel) {
                    continue;
                }
            }

            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };

            for (idx, line) in content.lines().enumerate() {
                if pattern.is_match(line) {
                    output.push_str(&format!(
                        "{}:{}:{}\n",
                        rel.display(),
                        idx + 1,
                        truncate_line(line, MAX_LINE_CHARS)
                    ));
                    result_count += 1;
                    if result_count >= a.max_results {
                        break 'files;
                    }
                }
            }
        }

        if result_count == 0 {
            output = "No matches found".to_string();
        }

        ToolResult {
            name: self.name().to_string(),
            output,
            duration_seconds: start.elapsed().as_secs_f64(),
            ..ToolResult::default()
        }
    }
}

fn truncate_line(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{truncated}...")
}
