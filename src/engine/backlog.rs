//! Backlog items and model-suggestion parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task in the engine's in-memory backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: String,
    pub description: String,
    /// 1 = critical, 2 = high, 3 = medium, 4 = low.
    pub priority: u8,
    /// Where the item came from: `user`, `scan`, or `test`.
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl BacklogItem {
    /// Build an item with a timestamp-derived id.
    #[must_use]
    pub fn new(prefix: &str, description: impl Into<String>, priority: u8, source: &str) -> Self {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        Self {
            id: format!("{prefix}-{nanos}"),
            description: description.into(),
            priority,
            source: source.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Insert an item unless one with the same description exists, then
/// re-sort by priority ascending. Returns whether the item was added.
pub fn insert(backlog: &mut Vec<BacklogItem>, item: BacklogItem) -> bool {
    if backlog.iter().any(|existing| existing.description == item.description) {
        return false;
    }
    backlog.push(item);
    backlog.sort_by_key(|item| item.priority);
    true
}

/// Status of a model suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionStatus {
    Executing,
    Queued,
    Skipped,
}

impl std::fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Executing => "EXECUTING",
            Self::Queued => "QUEUED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// A suggestion parsed from the model's `SUGGESTIONS:` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub item: String,
    pub status: SuggestionStatus,
    /// Populated for skipped items when a parenthesised reason is given.
    pub reason: String,
}

/// Parse the `SUGGESTIONS:` block from assistant content.
///
/// After a line beginning `SUGGESTIONS:`, non-empty lines are consumed
/// until a blank line or a heading. Each line splits on an em-dash into
/// the item and its status; unknown statuses default to QUEUED, and a
/// SKIPPED status may carry a reason in parentheses.
#[must_use]
pub fn parse_suggestions(content: &str) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    let mut in_block = false;

    for line in content.lines() {
        let line = line.trim();

        if line.starts_with("SUGGESTIONS:") {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            break;
        }

        let Some((item, status_part)) = line.split_once('\u{2014}') else {
            continue;
        };
        let item = item.trim().to_string();
        let status_part = status_part.trim();

        let (status, reason) = if status_part.contains("EXECUTING") {
            (SuggestionStatus::Executing, String::new())
        } else if status_part.contains("SKIPPED") {
            let reason = status_part
                .split_once('(')
                .and_then(|(_, rest)| rest.split_once(')'))
                .map(|(reason, _)| reason.to_string())
                .unwrap_or_default();
            (SuggestionStatus::Skipped, reason)
        } else {
            (SuggestionStatus::Queued, String::new())
        };

        suggestions.push(Suggestion {
            item,
            status,
            reason,
        });
    }

    suggestions
}

/// Extract shell commands from assistant markdown.
///
/// Legacy execute path, off by default: scans fenced shell blocks plus
/// `$ ` and `RUN: ` prefixed lines. The supported path is structured
/// tool calls.
#[must_use]
pub fn extract_commands(content: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut in_code_block = false;

    for line in content.lines() {
        let line = line.trim();

        if line.starts_with("```bash") || line.starts_with("```sh") || line.starts_with("```shell")
        {
            in_code_block = true;
            continue;
        }
        if line.starts_with("```") && in_code_block {
            in_code_block = false;
            continue;
        }

        if in_code_block && !line.is_empty() && !line.starts_with('#') {
            commands.push(line.to_string());
        }

        if let Some(rest) = line.strip_prefix("$ ") {
            commands.push(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("RUN: ") {
            commands.push(rest.to_string());
        }
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedup_keeps_first() {
        let mut backlog = Vec::new();
        assert!(insert(
            &mut backlog,
            BacklogItem::new("goal", "fix tests", 1, "user")
        ));
        assert!(!insert(
            &mut backlog,
            BacklogItem::new("scan", "fix tests", 3, "scan")
        ));

        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].priority, 1);
        assert_eq!(backlog[0].source, "user");
    }

    #[test]
    fn test_insert_sorts_by_priority() {
        let mut backlog = Vec::new();
        insert(&mut backlog, BacklogItem::new("a", "docs pass", 4, "scan"));
        insert(&mut backlog, BacklogItem::new("b", "failing test", 1, "test"));
        insert(&mut backlog, BacklogItem::new("c", "todo comment", 3, "scan"));

        let priorities: Vec<u8> = backlog.iter().map(|i| i.priority).collect();
        assert_eq!(priorities, vec![1, 3, 4]);
    }

    #[test]
    fn test_insert_dedup_is_case_sensitive() {
        let mut backlog = Vec::new();
        insert(&mut backlog, BacklogItem::new("a", "Fix tests", 1, "user"));
        assert!(insert(
            &mut backlog,
            BacklogItem::new("b", "fix tests", 2, "user")
        ));
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_parse_suggestions_statuses() {
        let content = "\
Working on it.

SUGGESTIONS:
Add retry logic \u{2014} EXECUTING
Refactor the parser \u{2014} QUEUED
Upgrade toolchain \u{2014} SKIPPED (needs network access)
Tidy imports \u{2014} something else

## Next section
Ignored line \u{2014} EXECUTING
";
        let suggestions = parse_suggestions(content);
        assert_eq!(suggestions.len(), 4);

        assert_eq!(suggestions[0].item, "Add retry logic");
        assert_eq!(suggestions[0].status, SuggestionStatus::Executing);

        assert_eq!(suggestions[1].status, SuggestionStatus::Queued);

        assert_eq!(suggestions[2].status, SuggestionStatus::Skipped);
        assert_eq!(suggestions[2].reason, "needs network access");

        // Unknown statuses default to QUEUED.
        assert_eq!(suggestions[3].status, SuggestionStatus::Queued);
    }

    #[test]
    fn test_parse_suggestions_stops_at_blank_line() {
        let content = "SUGGESTIONS:\nFirst \u{2014} QUEUED\n\nSecond \u{2014} QUEUED\n";
        let suggestions = parse_suggestions(content);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].item, "First");
    }

    #[test]
    fn test_parse_suggestions_absent() {
        assert!(parse_suggestions("no block here").is_empty());
    }

    #[test]
    fn test_parse_suggestions_line_without_dash_skipped() {
        let content = "SUGGESTIONS:\nmalformed line\nGood one \u{2014} EXECUTING\n";
        let suggestions = parse_suggestions(content);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].item, "Good one");
    }

    #[test]
    fn test_extract_commands_from_fenced_block() {
        let content = "\
Run these:
```bash
ls -la
# a comment
cargo test
```
Done.
";
        assert_eq!(extract_commands(content), vec!["ls -la", "cargo test"]);
    }

    #[test]
    fn test_extract_commands_prefixes() {
        let content = "$ echo hi\nRUN: make build\nplain text\n";
        assert_eq!(extract_commands(content), vec!["echo hi", "make build"]);
    }

    #[test]
    fn test_extract_commands_ignores_non_shell_fences() {
        let content = "```rust\nfn main() {}\n```\n";
        assert!(extract_commands(content).is_empty());
    }
}
