//! Filesystem tools: `fs_list`, `fs_read`, `fs_write`.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{path_guard, Tool, ToolContext, ToolResult, SKIP_DIRS};

fn parse_args<T: serde::de::DeserializeOwned>(name: &str, args: Value) -> Result<T, ToolResult> {
    serde_json::from_value::<T>(args).map_err(|e| ToolResult::failed(name, e, 0.0))
}

// =============================================================================
// fs_list
// =============================================================================

/// Lists files and directories under a path.
pub struct FsList;

#[derive(Deserialize)]
struct FsListArgs {
    path: String,
    #[serde(default)]
    depth: i32,
}

#[async_trait]
impl Tool for FsList {
    fn name(&self) -> &'static str {
        "fs_list"
    }

    fn description(&self) -> &'static str {
        "List files and directories in a path. Returns file names and sizes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to workspace root to list"
                },
                "depth": {
                    "type": "integer",
                    "description": "Maximum depth to recurse (0 = current dir only, -1 = unlimited)",
                    "default": 1
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let mut a: FsListArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(r) => return r,
        };
        if a.depth == 0 {
            a.depth = 1;
        }

        let target = match path_guard::resolve(&ctx.workspace_root, &a.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        };

        let mut walker = WalkDir::new(&target);
        if a.depth > 0 {
            walker = walker.max_depth(a.depth as usize);
        }

        let mut output = String::new();
        let entries = walker.into_iter().filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
        });

        for entry in entries {
            if ctx.cancel.is_cancelled() {
                return ToolResult::failed(
                    self.name(),
                    "operation cancelled",
                    start.elapsed().as_secs_f64(),
                );
            }
            let Ok(entry) = entry else { continue };
            if entry.depth() == 0 {
                continue;
            }
            let indent = "  ".repeat(entry.depth() - 1);
            if entry.file_type().is_dir() {
                output.push_str(&format!("{indent}{}/\n", entry.file_name().to_string_lossy()));
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                output.push_str(&format!(
                    "{indent}{} ({size} bytes)\n",
                    entry.file_name().to_string_lossy()
                ));
            }
        }

        ToolResult {
            name: self.name().to_string(),
            output,
            duration_seconds: start.elapsed().as_secs_f64(),
            ..ToolResult::default()
        }
    }
}

// =============================================================================
// fs_read
// =============================================================================

/// Reads file contents with an optional 1-indexed inclusive line range.
pub struct FsRead;

#[derive(Deserialize)]
struct FsReadArgs {
    path: String,
    #[serde(default)]
    start_line: u32,
    #[serde(default)]
    end_line: u32,
}

#[async_trait]
impl Tool for FsRead {
    fn name(&self) -> &'static str {
        "fs_read"
    }

    fn description(&self) -> &'static str {
        "Read the contents of a file. Can optionally specify line range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to workspace root to read"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Starting line number (1-indexed, 0 for beginning)",
                    "default": 0
                },
                "end_line": {
                    "type": "integer",
                    "description": "Ending line number (0 for end of file)",
                    "default": 0
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: FsReadArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(r) => return r,
        };

        let target = match path_guard::resolve(&ctx.workspace_root, &a.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        };

        let content = match std::fs::read_to_string(&target) {
            Ok(c) => c,
            Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        };

        let mut output = String::new();
        for (idx, line) in content.lines().enumerate() {
            let line_num = (idx + 1) as u32;
            if a.start_line > 0 && line_num < a.start_line {
                continue;
            }
            if a.end_line > 0 && line_num > a.end_line {
                break;
            }
            output.push_str(&format!("{line_num:04}: {line}\n"));
        }

        ToolResult {
            name: self.name().to_string(),
            output,
            duration_seconds: start.elapsed().as_secs_f64(),
            ..ToolResult::default()
        }
    }
}

// =============================================================================
// fs_write
// =============================================================================

/// Writes file contents, creating parent directories as needed.
pub struct FsWrite;

#[derive(Deserialize)]
struct FsWriteArgs {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for FsWrite {
    fn name(&self) -> &'static str {
        "fs_write"
    }

    fn description(&self) -> &'static str {
        "Write content to a file. Creates parent directories if needed. Use fs_patch for large files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to workspace root to write"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let a: FsWriteArgs = match parse_args(self.name(), args) {
            Ok(a) => a,
            Err(r) => return r,
        };

        let target = match path_guard::resolve(&ctx.workspace_root, &a.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        };

        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64());
            }
        }

        if let Err(e) = std::fs::write(&target, &a.content) {
            return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64());
        }

        let rel = target
            .strip_prefix(&ctx.workspace_root)
            .unwrap_or(&target)
            .display();

        ToolResult {
            name: self.name().to_string(),
            output: format!("Written {} bytes to {rel}", a.content.len()),
            duration_seconds: start.elapsed().as_secs_f64(),
            ..ToolResult::default()
        }
    }
}
