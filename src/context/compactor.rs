//! Transcript and tool-output compaction.
//!
//! Three composable operations: eliding long tool outputs (head + tail in
//! context, full body spilled to disk), trimming the conversation to the
//! budgeted number of turns with a summary of what was dropped, and
//! assembling the rolling-memory markdown block.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};
use tracing::warn;

use super::budget::BudgetManager;
use crate::error::Result;
use crate::llm::{ChatMessage, Role};

/// Compactor configuration.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub workspace_root: PathBuf,
    /// Outputs with at most this many lines stay inline in full.
    pub max_tool_output_lines: usize,
    /// Lines kept from the start of an elided output.
    pub tool_output_head_lines: usize,
    /// Lines kept from the end of an elided output.
    pub tool_output_tail_lines: usize,
    /// Fallback turn cap when no budget manager is wired.
    pub max_transcript_turns: usize,
    /// Whether full outputs are spilled to disk.
    pub enable_log_storage: bool,
    /// Spill directory.
    pub log_dir: PathBuf,
}

impl CompactorConfig {
    /// Default configuration for a workspace.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let log_dir = workspace_root
            .join(".brewol")
            .join("logs")
            .join("tool_outputs");
        Self {
            workspace_root,
            max_tool_output_lines: 20,
            tool_output_head_lines: 10,
            tool_output_tail_lines: 10,
            max_transcript_turns: 5,
            enable_log_storage: true,
            log_dir,
        }
    }
}

/// A tool execution output headed for the conversation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub name: String,
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Inputs to the rolling-memory block builder.
#[derive(Debug, Clone, Default)]
pub struct RollingMemoryUpdate {
    pub git_branch: String,
    pub git_diff: String,
    pub last_test_command: String,
    pub last_test_result: String,
    pub current_objective: String,
    pub task_brief: String,
    pub compaction_summary: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Compacts tool outputs and conversation history.
#[derive(Debug)]
pub struct Compactor {
    config: CompactorConfig,
    log_counter: Mutex<u64>,
}

impl Compactor {
    /// Create a compactor, preparing the spill directory when enabled.
    pub fn new(config: CompactorConfig) -> Result<Self> {
        if config.enable_log_storage {
            std::fs::create_dir_all(&config.log_dir)?;
        }
        Ok(Self {
            config,
            log_counter: Mutex::new(0),
        })
    }

    /// The spill directory.
    #[must_use]
    pub fn log_dir(&self) -> &PathBuf {
        &self.config.log_dir
    }

    /// Compact a tool output into its in-context markdown block.
    ///
    /// Small outputs are kept in full; longer ones keep head and tail
    /// lines around an omission marker, with the full body written to a
    /// log file referenced from the block.
    #[must_use]
    pub fn compact_tool_output(&self, output: &ToolOutput) -> String {
        let lines: Vec<&str> = output.output.split('\n').collect();
        let total = lines.len();

        if total <= self.config.max_tool_output_lines {
            return self.format_tool_output(output, &output.output, None);
        }

        let log_path = if self.config.enable_log_storage {
            let counter = {
                let mut guard = self.log_counter.lock().expect("compactor lock");
                *guard += 1;
                *guard
            };
            let filename = format!(
                "{}_{}_{counter}.log",
                output.name,
                output.timestamp.timestamp()
            );
            let path = self.config.log_dir.join(filename);
            match std::fs::write(&path, &output.output) {
                Ok(()) => Some(path.display().to_string()),
                Err(e) => {
                    warn!("failed to spill tool output: {e}");
                    Some(format!("(failed to save: {e})"))
                }
            }
        } else {
            None
        };

        let mut head = self.config.tool_output_head_lines;
        let mut tail = self.config.tool_output_tail_lines;
        if head + tail >= total {
            head = self.config.max_tool_output_lines / 2;
            tail = self.config.max_tool_output_lines - head;
        }

        let mut compacted = String::new();
        for line in &lines[..head.min(total)] {
            compacted.push_str(line);
            compacted.push('\n');
        }

        let omitted = total.saturating_sub(head + tail);
        if omitted > 0 {
            compacted.push_str(&format!("\n... [{omitted} lines omitted] ...\n\n"));
        }

        let tail_start = total.saturating_sub(tail).max(head);
        for (i, line) in lines[tail_start..].iter().enumerate() {
            compacted.push_str(line);
            if tail_start + i < total - 1 {
                compacted.push('\n');
            }
        }

        self.format_tool_output(output, &compacted, log_path.as_deref())
    }

    /// Format a tool output as a markdown block for model context.
    fn format_tool_output(
        &self,
        output: &ToolOutput,
        content: &str,
        log_path: Option<&str>,
    ) -> String {
        let mut block = format!("### Tool: {}\n", output.name);
        if !output.command.is_empty() {
            block.push_str(&format!("Command: `{}`\n", truncate(&output.command, 100)));
        }
        block.push_str(&format!(
            "Exit Code: {} | Duration: {:.2}s\n",
            output.exit_code, output.duration_seconds
        ));
        if let Some(error) = output.error.as_deref().filter(|e| !e.is_empty()) {
            block.push_str(&format!("Error: {}\n", truncate(error, 200)));
        }

        block.push_str("```\n");
        block.push_str(content);
        if !content.ends_with('\n') {
            block.push('\n');
        }
        block.push_str("```\n");

        if let Some(path) = log_path {
            block.push_str(&format!("Full log: {path}\n"));
        }

        block
    }

    /// Compact the conversation transcript to the budgeted turn count.
    ///
    /// One turn is one user + one assistant message. When `keep_system` is
    /// set and the first message is the system message, it is preserved
    /// untouched. Returns the compacted list and a summary of removed
    /// messages (empty when nothing was dropped).
    #[must_use]
    pub fn compact_transcript(
        &self,
        messages: &[ChatMessage],
        keep_system: bool,
        budget: Option<&BudgetManager>,
    ) -> (Vec<ChatMessage>, String) {
        if messages.is_empty() {
            return (Vec::new(), String::new());
        }

        let max_turns = budget
            .map(BudgetManager::max_transcript_turns)
            .unwrap_or(self.config.max_transcript_turns);

        let mut max_messages = max_turns * 2;
        let keep_first = keep_system && messages[0].role == Role::System;
        if keep_first {
            max_messages += 1;
        }

        if messages.len() <= max_messages {
            return (messages.to_vec(), String::new());
        }

        let removed_count = messages.len() - max_messages;
        let mut summary = format!("[Transcript compacted: {removed_count} earlier messages removed]\n");

        let start = usize::from(keep_first);
        for message in &messages[start..start + removed_count] {
            if message.role == Role::Assistant {
                if let Some(action) = extract_key_action(&message.content) {
                    summary.push_str(&format!("- {action}\n"));
                }
            }
        }

        let mut compacted = Vec::with_capacity(max_messages);
        if keep_first {
            compacted.push(messages[0].clone());
        }
        compacted.extend_from_slice(&messages[start + removed_count..]);

        (compacted, summary)
    }

    /// Compact a single over-long message, preferring to keep structural
    /// lines (headings, objectives, commands) of assistant messages.
    #[must_use]
    pub fn compact_message(&self, message: &ChatMessage, max_length: usize) -> ChatMessage {
        if message.content.len() <= max_length {
            return message.clone();
        }

        let content = if message.role == Role::Assistant {
            compact_assistant_content(&message.content, max_length)
        } else {
            truncate(&message.content, max_length)
        };

        ChatMessage {
            content,
            ..message.clone()
        }
    }

    /// Build the `## ROLLING MEMORY` markdown block.
    #[must_use]
    pub fn build_rolling_memory(&self, update: &RollingMemoryUpdate) -> String {
        let mut block = String::from("## ROLLING MEMORY\n\n");

        if !update.current_objective.is_empty() {
            block.push_str(&format!(
                "**Current Objective:** {}\n\n",
                update.current_objective
            ));
        }
        if !update.git_branch.is_empty() {
            block.push_str(&format!("**Git Branch:** {}\n", update.git_branch));
        }
        if !update.git_diff.is_empty() {
            block.push_str("**Uncommitted Changes:**\n```diff\n");
            block.push_str(&truncate(&update.git_diff, 500));
            block.push_str("\n```\n\n");
        }
        if !update.last_test_command.is_empty() {
            block.push_str(&format!("**Last Test:** `{}`\n", update.last_test_command));
            if !update.last_test_result.is_empty() {
                block.push_str(&format!(
                    "**Result:** {}\n",
                    truncate(&update.last_test_result, 100)
                ));
            }
            block.push('\n');
        }
        if !update.task_brief.is_empty() {
            block.push_str(&update.task_brief);
            block.push('\n');
        }
        if !update.compaction_summary.is_empty() {
            block.push_str("**Compaction Summary:**\n");
            block.push_str(&update.compaction_summary);
            block.push('\n');
        }

        let timestamp = update.timestamp.unwrap_or_else(Utc::now);
        block.push_str(&format!(
            "\n*Memory updated: {}*\n",
            timestamp.with_timezone(&Local).format("%H:%M:%S")
        ));

        block
    }
}

/// Extract a key action line from an assistant message, if present.
fn extract_key_action(content: &str) -> Option<String> {
    content.lines().map(str::trim).find_map(|line| {
        ["Objective:", "Goal:", "RUN:", "EXECUTING:"]
            .iter()
            .any(|prefix| line.starts_with(prefix))
            .then(|| truncate(line, 80))
    })
}

/// Compact assistant content, keeping priority lines first.
fn compact_assistant_content(content: &str, max_length: usize) -> String {
    let mut priority_lines = Vec::new();
    let mut other_lines = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#')
            || trimmed.starts_with("Objective:")
            || trimmed.starts_with("Goal:")
            || trimmed.starts_with("RUN:")
            || trimmed.starts_with("```")
        {
            priority_lines.push(line);
        } else if !trimmed.is_empty() {
            other_lines.push(line);
        }
    }

    let mut result = String::new();
    let mut remaining = max_length;
    for line in priority_lines.into_iter().chain(other_lines) {
        if remaining == 0 || line.len() + 1 > remaining {
            break;
        }
        result.push_str(line);
        result.push('\n');
        remaining -= line.len() + 1;
    }

    if result.len() < content.len() {
        result.push_str("[Content truncated]");
    }
    result
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = if max_len > 3 { max_len - 3 } else { max_len };
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    if max_len <= 3 {
        s[..cut].to_string()
    } else {
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::BudgetConfig;
    use tempfile::TempDir;

    fn compactor(dir: &TempDir) -> Compactor {
        Compactor::new(CompactorConfig::new(dir.path())).unwrap()
    }

    fn tool_output(lines: usize) -> ToolOutput {
        ToolOutput {
            name: "exec".to_string(),
            command: "cargo test".to_string(),
            exit_code: 0,
            output: (0..lines)
                .map(|i| format!("line {i}"))
                .collect::<Vec<_>>()
                .join("\n"),
            error: None,
            duration_seconds: 1.25,
            timestamp: Utc::now(),
        }
    }

    fn messages(n: usize, with_system: bool) -> Vec<ChatMessage> {
        let mut msgs = Vec::new();
        if with_system {
            msgs.push(ChatMessage::text(Role::System, "system prompt"));
        }
        for i in 0..n {
            msgs.push(ChatMessage::text(Role::User, format!("u{}", i + 1)));
            msgs.push(ChatMessage::text(Role::Assistant, format!("a{}", i + 1)));
        }
        msgs
    }

    #[test]
    fn test_small_tool_output_kept_inline() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);

        let block = c.compact_tool_output(&tool_output(5));
        assert!(block.starts_with("### Tool: exec"));
        assert!(block.contains("Command: `cargo test`"));
        assert!(block.contains("Exit Code: 0 | Duration: 1.25s"));
        assert!(block.contains("line 0"));
        assert!(block.contains("line 4"));
        assert!(!block.contains("omitted"));
        assert!(!block.contains("Full log:"));
    }

    #[test]
    fn test_long_tool_output_elided_with_spill() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);

        let block = c.compact_tool_output(&tool_output(100));
        assert!(block.contains("line 0"));
        assert!(block.contains("line 9"));
        assert!(block.contains("... [80 lines omitted] ..."));
        assert!(block.contains("line 90"));
        assert!(block.contains("line 99"));
        assert!(!block.contains("line 50"));
        assert!(block.contains("Full log: "));

        let spilled: Vec<_> = std::fs::read_dir(c.log_dir()).unwrap().flatten().collect();
        assert_eq!(spilled.len(), 1);
        let body = std::fs::read_to_string(spilled[0].path()).unwrap();
        assert!(body.contains("line 50"));
    }

    #[test]
    fn test_tool_output_error_line() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let mut output = tool_output(3);
        output.error = Some("exit status 1".to_string());

        let block = c.compact_tool_output(&output);
        assert!(block.contains("Error: exit status 1"));
    }

    #[test]
    fn test_transcript_no_compaction_needed() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let msgs = messages(3, true);

        let (compacted, summary) = c.compact_transcript(&msgs, true, None);
        assert_eq!(compacted.len(), msgs.len());
        assert!(summary.is_empty());
    }

    #[test]
    fn test_transcript_compaction_keeps_system_and_tail() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let budget = BudgetManager::new(BudgetConfig {
            max_transcript_turns: 3,
            ..BudgetConfig::default()
        });

        // [system, u1,a1,u2,a2,u3,a3,u4,a4,u5,a5] -> [system, u3..a5]
        let msgs = messages(5, true);
        assert_eq!(msgs.len(), 11);

        let (compacted, summary) = c.compact_transcript(&msgs, true, Some(&budget));
        assert_eq!(compacted.len(), 7);
        assert_eq!(compacted[0].role, Role::System);
        assert_eq!(compacted[1].content, "u3");
        assert_eq!(compacted[6].content, "a5");
        assert!(summary.starts_with("[Transcript compacted: 4 earlier messages removed]"));
    }

    #[test]
    fn test_transcript_compaction_without_system() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let budget = BudgetManager::new(BudgetConfig {
            max_transcript_turns: 2,
            ..BudgetConfig::default()
        });

        let msgs = messages(4, false);
        let (compacted, summary) = c.compact_transcript(&msgs, true, Some(&budget));
        assert_eq!(compacted.len(), 4);
        assert_eq!(compacted[0].content, "u3");
        assert!(summary.contains("4 earlier messages removed"));
    }

    #[test]
    fn test_transcript_summary_extracts_key_actions() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let budget = BudgetManager::new(BudgetConfig {
            max_transcript_turns: 1,
            ..BudgetConfig::default()
        });

        let mut msgs = vec![ChatMessage::text(Role::System, "sys")];
        msgs.push(ChatMessage::text(Role::User, "u1"));
        msgs.push(ChatMessage::text(
            Role::Assistant,
            "Objective: fix the flaky test\nsome detail",
        ));
        msgs.push(ChatMessage::text(Role::User, "u2"));
        msgs.push(ChatMessage::text(Role::Assistant, "RUN: cargo test -q"));
        msgs.push(ChatMessage::text(Role::User, "u3"));
        msgs.push(ChatMessage::text(Role::Assistant, "a3"));

        let (_, summary) = c.compact_transcript(&msgs, true, Some(&budget));
        assert!(summary.contains("- Objective: fix the flaky test"));
        assert!(summary.contains("- RUN: cargo test -q"));
    }

    #[test]
    fn test_key_action_first_match_truncated() {
        let long = format!("Goal: {}", "g".repeat(120));
        let action = extract_key_action(&long).unwrap();
        assert_eq!(action.len(), 80);
        assert!(action.ends_with("..."));

        assert!(extract_key_action("nothing interesting").is_none());
    }

    #[test]
    fn test_compact_message_assistant_keeps_structure() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);

        let content = format!("# Plan\nObjective: ship it\n{}", "filler line\n".repeat(100));
        let msg = ChatMessage::text(Role::Assistant, content);
        let compacted = c.compact_message(&msg, 120);

        assert!(compacted.content.contains("# Plan"));
        assert!(compacted.content.contains("Objective: ship it"));
        assert!(compacted.content.contains("[Content truncated]"));
        assert!(compacted.content.len() < msg.content.len());
    }

    #[test]
    fn test_compact_message_short_untouched() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let msg = ChatMessage::text(Role::User, "short");
        assert_eq!(c.compact_message(&msg, 100).content, "short");
    }

    #[test]
    fn test_build_rolling_memory_block() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);

        let block = c.build_rolling_memory(&RollingMemoryUpdate {
            git_branch: "agent/20250101-000000".to_string(),
            git_diff: "+added line".to_string(),
            last_test_command: "cargo test".to_string(),
            last_test_result: "42 passed".to_string(),
            current_objective: "stabilise CI".to_string(),
            task_brief: "## TASK STATUS\nPending: 3 tasks".to_string(),
            compaction_summary: "[Transcript compacted: 4 earlier messages removed]".to_string(),
            timestamp: Some(Utc::now()),
        });

        assert!(block.starts_with("## ROLLING MEMORY"));
        assert!(block.contains("**Current Objective:** stabilise CI"));
        assert!(block.contains("**Git Branch:** agent/20250101-000000"));
        assert!(block.contains("```diff\n+added line\n```"));
        assert!(block.contains("**Last Test:** `cargo test`"));
        assert!(block.contains("**Result:** 42 passed"));
        assert!(block.contains("## TASK STATUS"));
        assert!(block.contains("**Compaction Summary:**"));
        assert!(block.contains("*Memory updated: "));
    }

    #[test]
    fn test_build_rolling_memory_skips_empty_fields() {
        let dir = TempDir::new().unwrap();
        let c = compactor(&dir);
        let block = c.build_rolling_memory(&RollingMemoryUpdate::default());
        assert!(!block.contains("**Git Branch:**"));
        assert!(!block.contains("**Last Test:**"));
        assert!(!block.contains("**Current Objective:**"));
    }
}
