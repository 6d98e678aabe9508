//! Leveled task briefs for the prompt.
//!
//! A brief is an immutable snapshot of the task store rendered small
//! enough for the available context budget. Levels trade detail for
//! size: Full shows three upcoming tasks, Minimal only counts.

use std::collections::HashMap;

use super::taskstore::{Task, TaskCategory, TaskPriority, TaskStore};

/// Brief compaction level. Higher levels are more compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BriefLevel {
    /// Objective + 3 tasks + counts + verification.
    Full,
    /// Objective + 2 tasks + counts + verification.
    Normal,
    /// Objective + 1 task + counts.
    Compact,
    /// Objective + counts only.
    Minimal,
}

impl BriefLevel {
    /// Number of upcoming tasks shown at this level.
    #[must_use]
    pub fn max_tasks_shown(self) -> usize {
        match self {
            Self::Full => 3,
            Self::Normal => 2,
            Self::Compact => 1,
            Self::Minimal => 0,
        }
    }

    /// Whether the verification result is included at this level.
    #[must_use]
    pub fn shows_verification(self) -> bool {
        matches!(self, Self::Full | Self::Normal)
    }
}

/// Pick a brief level for the available token budget.
///
/// # Example
///
/// ```
/// use brewol::context::taskbrief::{level_for_budget, BriefLevel};
///
/// assert_eq!(level_for_budget(800), BriefLevel::Full);
/// assert_eq!(level_for_budget(350), BriefLevel::Normal);
/// assert_eq!(level_for_budget(200), BriefLevel::Compact);
/// assert_eq!(level_for_budget(50), BriefLevel::Minimal);
/// ```
#[must_use]
pub fn level_for_budget(available_tokens: i64) -> BriefLevel {
    match available_tokens {
        t if t >= 500 => BriefLevel::Full,
        t if t >= 300 => BriefLevel::Normal,
        t if t >= 150 => BriefLevel::Compact,
        _ => BriefLevel::Minimal,
    }
}

/// A compact task summary for the model context.
#[derive(Debug, Clone)]
pub struct TaskBrief {
    pub objective: String,
    pub current_task: Option<Task>,
    pub next_tasks: Vec<Task>,
    pub category_counts: HashMap<TaskCategory, usize>,
    pub priority_counts: HashMap<TaskPriority, usize>,
    pub total_pending: usize,
    pub verify_result: String,
    pub level: BriefLevel,
}

/// Generates briefs from a task store.
#[derive(Debug)]
pub struct TaskBriefGenerator<'a> {
    store: &'a TaskStore,
}

impl<'a> TaskBriefGenerator<'a> {
    /// Create a generator over the given store.
    #[must_use]
    pub fn new(store: &'a TaskStore) -> Self {
        Self { store }
    }

    /// Snapshot the store into a brief at the given level.
    #[must_use]
    pub fn generate(&self, level: BriefLevel, objective: &str, verify_result: &str) -> TaskBrief {
        let mut next_tasks = Vec::new();
        let max_shown = level.max_tasks_shown();
        if max_shown > 0 {
            next_tasks = self.store.pending();
            next_tasks.truncate(max_shown);
        }

        TaskBrief {
            objective: objective.to_string(),
            current_task: self.store.current(),
            next_tasks,
            category_counts: self.store.category_counts(),
            priority_counts: self.store.priority_counts(),
            total_pending: self.store.count_pending(),
            verify_result: if level.shows_verification() {
                verify_result.to_string()
            } else {
                String::new()
            },
            level,
        }
    }

    /// Regenerate a brief at a more compact level. A level at or below the
    /// brief's current one returns it unchanged.
    #[must_use]
    pub fn shrink_to_level(&self, brief: TaskBrief, level: BriefLevel) -> TaskBrief {
        if level <= brief.level {
            return brief;
        }
        self.generate(level, &brief.objective, &brief.verify_result)
    }
}

impl TaskBrief {
    /// Full markdown rendering.
    #[must_use]
    pub fn format(&self) -> String {
        let mut b = String::from("## TASK STATUS\n\n");

        if !self.objective.is_empty() {
            b.push_str(&format!(
                "**Current Objective:** {}\n\n",
                truncate(&self.objective, 80)
            ));
        }

        if let Some(current) = &self.current_task {
            b.push_str(&format!(
                "**Executing:** [P{}] {}\n",
                current.priority,
                truncate(&current.title, 60)
            ));
            if let Some(next_action) = current.next_action.as_deref().filter(|a| !a.is_empty()) {
                b.push_str(&format!("  -> Next: {}\n", truncate(next_action, 50)));
            }
            b.push('\n');
        }

        if !self.next_tasks.is_empty() {
            b.push_str("**Next Tasks:**\n");
            for (i, task) in self.next_tasks.iter().enumerate() {
                b.push_str(&format!(
                    "{}. [P{}/{}] {}\n",
                    i + 1,
                    task.priority,
                    task.category,
                    truncate(&task.title, 55)
                ));
            }
            b.push('\n');
        }

        let mut categories: Vec<_> = self
            .category_counts
            .iter()
            .filter(|(_, &count)| count > 0)
            .collect();
        categories.sort_by_key(|(cat, _)| cat.to_string());
        if !categories.is_empty() {
            b.push_str("**Remaining by Category:**\n");
            for (category, count) in categories {
                b.push_str(&format!("  {category}: {count}\n"));
            }
            b.push('\n');
        }

        if self.total_pending > 0 {
            let shown = self.next_tasks.len() + usize::from(self.current_task.is_some());
            let remaining = self.total_pending.saturating_sub(shown);
            if remaining > 0 {
                b.push_str(&format!("**Total Remaining:** {remaining} tasks\n\n"));
            }
        }

        if !self.verify_result.is_empty() {
            b.push_str(&format!("**Last Verification:** {}\n", self.verify_result));
        }

        b
    }

    /// Shorter rendering for tight budgets.
    #[must_use]
    pub fn format_compact(&self) -> String {
        let mut b = String::from("## TASK STATUS\n");

        if !self.objective.is_empty() {
            b.push_str(&format!("Objective: {}\n", truncate(&self.objective, 60)));
        }

        if let Some(current) = &self.current_task {
            b.push_str(&format!("Current: {}\n", truncate(&current.title, 50)));
        } else if let Some(next) = self.next_tasks.first() {
            b.push_str(&format!("Next: {}\n", truncate(&next.title, 50)));
        }

        if self.total_pending > 0 {
            b.push_str(&format!("Pending: {} tasks\n", self.total_pending));
        }

        b
    }

    /// Single-line pipe-separated rendering.
    #[must_use]
    pub fn format_one_line(&self) -> String {
        let mut parts = Vec::with_capacity(3);

        if !self.objective.is_empty() {
            parts.push(format!("Goal: {}", truncate(&self.objective, 40)));
        }
        if let Some(current) = &self.current_task {
            parts.push(format!("Doing: {}", truncate(&current.title, 30)));
        }
        if self.total_pending > 0 {
            parts.push(format!("{} pending", self.total_pending));
        }

        parts.join(" | ")
    }

    /// Rough token estimate of the full rendering.
    #[must_use]
    pub fn estimate_tokens(&self) -> usize {
        self.format().len() / 4
    }
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
    use crate::context::taskstore::{Task, TaskStatus};
    use tempfile::TempDir;

    fn store_with_tasks(dir: &TempDir) -> TaskStore {
        let store = TaskStore::new(dir.path()).unwrap();
        for (title, priority, category) in [
            ("fix failing test", TaskPriority::Critical, TaskCategory::Test),
            ("implement goal", TaskPriority::High, TaskCategory::Goal),
            ("address TODO", TaskPriority::Medium, TaskCategory::Todo),
            ("tidy docs", TaskPriority::Low, TaskCategory::Docs),
        ] {
            store.add(Task::new(title, priority, category)).unwrap();
        }
        store
    }

    #[test]
    fn test_level_task_counts() {
        assert_eq!(BriefLevel::Full.max_tasks_shown(), 3);
        assert_eq!(BriefLevel::Normal.max_tasks_shown(), 2);
        assert_eq!(BriefLevel::Compact.max_tasks_shown(), 1);
        assert_eq!(BriefLevel::Minimal.max_tasks_shown(), 0);
    }

    #[test]
    fn test_level_for_budget_thresholds() {
        assert_eq!(level_for_budget(500), BriefLevel::Full);
        assert_eq!(level_for_budget(499), BriefLevel::Normal);
        assert_eq!(level_for_budget(300), BriefLevel::Normal);
        assert_eq!(level_for_budget(299), BriefLevel::Compact);
        assert_eq!(level_for_budget(150), BriefLevel::Compact);
        assert_eq!(level_for_budget(149), BriefLevel::Minimal);
        assert_eq!(level_for_budget(-10), BriefLevel::Minimal);
    }

    #[test]
    fn test_generate_full_brief() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir);
        let generator = TaskBriefGenerator::new(&store);

        let brief = generator.generate(BriefLevel::Full, "ship release", "42 passed");
        assert_eq!(brief.next_tasks.len(), 3);
        assert_eq!(brief.next_tasks[0].title, "fix failing test");
        assert_eq!(brief.total_pending, 4);
        assert_eq!(brief.verify_result, "42 passed");
    }

    #[test]
    fn test_generate_minimal_hides_tasks_and_verification() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir);
        let generator = TaskBriefGenerator::new(&store);

        let brief = generator.generate(BriefLevel::Minimal, "ship release", "42 passed");
        assert!(brief.next_tasks.is_empty());
        assert!(brief.verify_result.is_empty());
        assert_eq!(brief.total_pending, 4);
    }

    #[test]
    fn test_format_full() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir);
        let current_id = store.all()[1].id.clone();
        store.set_status(&current_id, TaskStatus::InProgress).unwrap();
        store.set_next_action(&current_id, "wire the parser").unwrap();

        let generator = TaskBriefGenerator::new(&store);
        let brief = generator.generate(BriefLevel::Full, "ship release", "ok");
        let text = brief.format();

        assert!(text.starts_with("## TASK STATUS"));
        assert!(text.contains("**Current Objective:** ship release"));
        assert!(text.contains("**Executing:** [P2] implement goal"));
        assert!(text.contains("-> Next: wire the parser"));
        assert!(text.contains("**Next Tasks:**"));
        assert!(text.contains("1. [P1/test] fix failing test"));
        assert!(text.contains("**Remaining by Category:**"));
        assert!(text.contains("**Last Verification:** ok"));
    }

    #[test]
    fn test_format_compact_and_one_line() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir);
        let generator = TaskBriefGenerator::new(&store);
        let brief = generator.generate(BriefLevel::Compact, "ship release", "");

        let compact = brief.format_compact();
        assert!(compact.contains("Objective: ship release"));
        assert!(compact.contains("Next: fix failing test"));
        assert!(compact.contains("Pending: 4 tasks"));

        let one_line = brief.format_one_line();
        assert_eq!(one_line, "Goal: ship release | 4 pending");
        assert!(!one_line.contains('\n'));
    }

    #[test]
    fn test_estimate_tokens_tracks_length() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir);
        let generator = TaskBriefGenerator::new(&store);
        let brief = generator.generate(BriefLevel::Full, "ship release", "");

        assert_eq!(brief.estimate_tokens(), brief.format().len() / 4);
        assert!(brief.estimate_tokens() > 0);
    }

    #[test]
    fn test_shrink_to_level() {
        let dir = TempDir::new().unwrap();
        let store = store_with_tasks(&dir);
        let generator = TaskBriefGenerator::new(&store);

        let full = generator.generate(BriefLevel::Full, "obj", "ok");
        let shrunk = generator.shrink_to_level(full.clone(), BriefLevel::Compact);
        assert_eq!(shrunk.level, BriefLevel::Compact);
        assert_eq!(shrunk.next_tasks.len(), 1);

        // Shrinking to a less compact level is a no-op.
        let same = generator.shrink_to_level(shrunk, BriefLevel::Full);
        assert_eq!(same.level, BriefLevel::Compact);
    }

    #[test]
    fn test_empty_store_brief() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path()).unwrap();
        let generator = TaskBriefGenerator::new(&store);
        let brief = generator.generate(BriefLevel::Full, "", "");

        let text = brief.format();
        assert_eq!(text, "## TASK STATUS\n\n");
        assert_eq!(brief.format_one_line(), "");
    }
}
