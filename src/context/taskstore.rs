//! Persistent prioritised task storage.
//!
//! Tasks live in `<workspace>/.brewol/tasks/tasks.json`; every mutation
//! saves synchronously under a file lock. Enumeration order is always
//! `(priority ascending, created_at ascending)`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{BrewolError, Result};

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Whether this status ends a task's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Task priority. Lower numbers run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum TaskPriority {
    /// P1: failing tests, build errors.
    Critical,
    /// P2: user goals, FIXME/HACK.
    High,
    /// P3: TODO comments.
    Medium,
    /// P4: style, docs.
    Low,
}

impl From<u8> for TaskPriority {
    fn from(value: u8) -> Self {
        match value {
            0 | 1 => Self::Critical,
            2 => Self::High,
            3 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl From<TaskPriority> for u8 {
    fn from(value: TaskPriority) -> Self {
        match value {
            TaskPriority::Critical => 1,
            TaskPriority::High => 2,
            TaskPriority::Medium => 3,
            TaskPriority::Low => 4,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Task category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Build,
    Test,
    Goal,
    Todo,
    Fixme,
    Refactor,
    Docs,
    Other,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Goal => "goal",
            Self::Todo => "todo",
            Self::Fixme => "fixme",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub category: TaskCategory,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A new pending task with the given title, priority, and category.
    #[must_use]
    pub fn new(title: impl Into<String>, priority: TaskPriority, category: TaskCategory) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title: title.into(),
            description: None,
            priority,
            status: TaskStatus::Pending,
            category,
            files: Vec::new(),
            evidence_logs: Vec::new(),
            next_action: None,
            attempts: 0,
            source: String::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Set the source label.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// JSON-backed prioritised task store.
#[derive(Debug)]
pub struct TaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    file_path: PathBuf,
}

impl TaskStore {
    /// Open (or create) the store for a workspace.
    pub fn new(workspace_root: &Path) -> Result<Self> {
        let store_dir = workspace_root.join(".brewol").join("tasks");
        fs::create_dir_all(&store_dir)?;
        let file_path = store_dir.join("tasks.json");

        let tasks = match fs::read_to_string(&file_path) {
            Ok(data) => {
                let list: Vec<Task> = serde_json::from_str(&data)
                    .map_err(|e| BrewolError::store(format!("failed to load tasks: {e}")))?;
                list.into_iter().map(|t| (t.id.clone(), t)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            tasks: Mutex::new(tasks),
            file_path,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn save_locked(&self, tasks: &HashMap<String, Task>) -> Result<()> {
        let lock_path = self.file_path.with_extension("json.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&lock_file)?;

        let mut list: Vec<&Task> = tasks.values().collect();
        list.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let data = serde_json::to_string_pretty(&list)?;
        let result = fs::write(&self.file_path, data);

        let _ = FileExt::unlock(&lock_file);
        result.map_err(Into::into)
    }

    /// Add a task, assigning an id and timestamps when absent. Saves
    /// synchronously and returns the assigned id.
    pub fn add(&self, mut task: Task) -> Result<String> {
        if task.id.is_empty() {
            let nanos = Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_else(|| Utc::now().timestamp_millis());
            task.id = format!("task-{nanos}");
        }
        task.updated_at = Utc::now();

        let id = task.id.clone();
        let mut tasks = self.tasks.lock().expect("taskstore lock");
        tasks.insert(id.clone(), task);
        self.save_locked(&tasks)?;
        Ok(id)
    }

    /// Apply a mutator to an existing task and save.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Task)) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("taskstore lock");
        let task = tasks.get_mut(id).ok_or_else(|| BrewolError::TaskNotFound {
            id: id.to_string(),
        })?;
        mutate(task);
        task.updated_at = Utc::now();
        self.save_locked(&tasks)
    }

    /// Get a copy of a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().expect("taskstore lock").get(id).cloned()
    }

    /// Remove a task by id and save.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("taskstore lock");
        tasks.remove(id);
        self.save_locked(&tasks)
    }

    fn sorted(&self, filter: impl Fn(&Task) -> bool) -> Vec<Task> {
        let tasks = self.tasks.lock().expect("taskstore lock");
        let mut list: Vec<Task> = tasks.values().filter(|t| filter(t)).cloned().collect();
        list.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        list
    }

    /// All tasks ordered by `(priority, created_at)`.
    #[must_use]
    pub fn all(&self) -> Vec<Task> {
        self.sorted(|_| true)
    }

    /// Tasks with the given status, ordered.
    #[must_use]
    pub fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.sorted(|t| t.status == status)
    }

    /// Tasks in the given category, ordered.
    #[must_use]
    pub fn by_category(&self, category: TaskCategory) -> Vec<Task> {
        self.sorted(|t| t.category == category)
    }

    /// Pending tasks, ordered.
    #[must_use]
    pub fn pending(&self) -> Vec<Task> {
        self.by_status(TaskStatus::Pending)
    }

    /// The first in-progress task, if any.
    #[must_use]
    pub fn current(&self) -> Option<Task> {
        self.by_status(TaskStatus::InProgress).into_iter().next()
    }

    /// The highest-priority pending task, if any.
    #[must_use]
    pub fn next(&self) -> Option<Task> {
        self.pending().into_iter().next()
    }

    /// Counts of open (pending or in-progress) tasks by category.
    #[must_use]
    pub fn category_counts(&self) -> HashMap<TaskCategory, usize> {
        let tasks = self.tasks.lock().expect("taskstore lock");
        let mut counts = HashMap::new();
        for task in tasks.values() {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
                *counts.entry(task.category).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Counts of open tasks by priority.
    #[must_use]
    pub fn priority_counts(&self) -> HashMap<TaskPriority, usize> {
        let tasks = self.tasks.lock().expect("taskstore lock");
        let mut counts = HashMap::new();
        for task in tasks.values() {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
                *counts.entry(task.priority).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Total number of tasks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.tasks.lock().expect("taskstore lock").len()
    }

    /// Number of open (pending or in-progress) tasks.
    #[must_use]
    pub fn count_pending(&self) -> usize {
        self.tasks
            .lock()
            .expect("taskstore lock")
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .count()
    }

    /// Set a task's status. Terminal statuses also set `completed_at`.
    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        self.update(id, |task| {
            task.status = status;
            if status.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
        })
    }

    /// Increment a task's attempt counter.
    pub fn increment_attempts(&self, id: &str) -> Result<()> {
        self.update(id, |task| task.attempts += 1)
    }

    /// Set a task's suggested next action.
    pub fn set_next_action(&self, id: &str, action: &str) -> Result<()> {
        self.update(id, |task| task.next_action = Some(action.to_string()))
    }

    /// Attach an evidence log path to a task.
    pub fn add_evidence(&self, id: &str, log_path: &str) -> Result<()> {
        self.update(id, |task| task.evidence_logs.push(log_path.to_string()))
    }

    /// Remove completed and skipped tasks.
    pub fn clear_completed(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("taskstore lock");
        tasks.retain(|_, t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped));
        self.save_locked(&tasks)
    }

    /// Remove all tasks.
    pub fn clear(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("taskstore lock");
        tasks.clear();
        self.save_locked(&tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> TaskStore {
        TaskStore::new(dir.path()).unwrap()
    }

    #[test]
    fn test_add_assigns_id_and_defaults() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        let id = s
            .add(Task::new("fix build", TaskPriority::Critical, TaskCategory::Build))
            .unwrap();
        assert!(id.starts_with("task-"));

        let task = s.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_ordering_priority_then_created() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        let mut low = Task::new("low", TaskPriority::Low, TaskCategory::Docs);
        low.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut medium_old = Task::new("medium old", TaskPriority::Medium, TaskCategory::Todo);
        medium_old.created_at = Utc::now() - chrono::Duration::hours(1);
        let medium_new = Task::new("medium new", TaskPriority::Medium, TaskCategory::Todo);
        let critical = Task::new("critical", TaskPriority::Critical, TaskCategory::Test);

        s.add(low).unwrap();
        s.add(medium_new).unwrap();
        s.add(medium_old).unwrap();
        s.add(critical).unwrap();

        let titles: Vec<String> = s.all().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["critical", "medium old", "medium new", "low"]);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let id = {
            let s = store(&dir);
            s.add(
                Task::new("persist me", TaskPriority::High, TaskCategory::Goal)
                    .with_source("user")
                    .with_description("longer text"),
            )
            .unwrap()
        };

        let s2 = store(&dir);
        let task = s2.get(&id).unwrap();
        assert_eq!(task.title, "persist me");
        assert_eq!(task.source, "user");
        assert_eq!(task.description.as_deref(), Some("longer text"));
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.category, TaskCategory::Goal);
    }

    #[test]
    fn test_set_status_terminal_sets_completed_at() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s
            .add(Task::new("t", TaskPriority::Medium, TaskCategory::Todo))
            .unwrap();

        let before = s.get(&id).unwrap().updated_at;
        s.set_status(&id, TaskStatus::Completed).unwrap();

        let task = s.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let completed_at = task.completed_at.unwrap();
        assert!(completed_at >= before);
    }

    #[test]
    fn test_set_status_non_terminal_leaves_completed_at() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s
            .add(Task::new("t", TaskPriority::Medium, TaskCategory::Todo))
            .unwrap();

        s.set_status(&id, TaskStatus::InProgress).unwrap();
        assert!(s.get(&id).unwrap().completed_at.is_none());
    }

    #[test]
    fn test_current_and_next() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(s.current().is_none());
        assert!(s.next().is_none());

        let a = s
            .add(Task::new("a", TaskPriority::High, TaskCategory::Goal))
            .unwrap();
        let b = s
            .add(Task::new("b", TaskPriority::Critical, TaskCategory::Test))
            .unwrap();

        assert_eq!(s.next().unwrap().id, b);
        s.set_status(&a, TaskStatus::InProgress).unwrap();
        assert_eq!(s.current().unwrap().id, a);
    }

    #[test]
    fn test_counts() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.add(Task::new("a", TaskPriority::Critical, TaskCategory::Test))
            .unwrap();
        s.add(Task::new("b", TaskPriority::Critical, TaskCategory::Test))
            .unwrap();
        let done = s
            .add(Task::new("c", TaskPriority::Low, TaskCategory::Docs))
            .unwrap();
        s.set_status(&done, TaskStatus::Completed).unwrap();

        assert_eq!(s.count(), 3);
        assert_eq!(s.count_pending(), 2);
        assert_eq!(s.category_counts()[&TaskCategory::Test], 2);
        assert!(!s.category_counts().contains_key(&TaskCategory::Docs));
        assert_eq!(s.priority_counts()[&TaskPriority::Critical], 2);
    }

    #[test]
    fn test_increment_attempts_monotonic() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s
            .add(Task::new("t", TaskPriority::Medium, TaskCategory::Todo))
            .unwrap();

        s.increment_attempts(&id).unwrap();
        s.increment_attempts(&id).unwrap();
        assert_eq!(s.get(&id).unwrap().attempts, 2);
    }

    #[test]
    fn test_next_action_and_evidence() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s
            .add(Task::new("t", TaskPriority::Medium, TaskCategory::Todo))
            .unwrap();

        s.set_next_action(&id, "run the tests").unwrap();
        s.add_evidence(&id, "/logs/a.log").unwrap();
        s.add_evidence(&id, "/logs/b.log").unwrap();

        let task = s.get(&id).unwrap();
        assert_eq!(task.next_action.as_deref(), Some("run the tests"));
        assert_eq!(task.evidence_logs, vec!["/logs/a.log", "/logs/b.log"]);
    }

    #[test]
    fn test_clear_completed_keeps_failed() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let done = s
            .add(Task::new("done", TaskPriority::Low, TaskCategory::Other))
            .unwrap();
        let skipped = s
            .add(Task::new("skipped", TaskPriority::Low, TaskCategory::Other))
            .unwrap();
        let failed = s
            .add(Task::new("failed", TaskPriority::Low, TaskCategory::Other))
            .unwrap();
        s.set_status(&done, TaskStatus::Completed).unwrap();
        s.set_status(&skipped, TaskStatus::Skipped).unwrap();
        s.set_status(&failed, TaskStatus::Failed).unwrap();

        s.clear_completed().unwrap();
        assert!(s.get(&done).is_none());
        assert!(s.get(&skipped).is_none());
        assert!(s.get(&failed).is_some());
    }

    #[test]
    fn test_update_unknown_task() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let err = s.update("task-404", |_| {}).unwrap_err();
        assert!(matches!(err, BrewolError::TaskNotFound { .. }));
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s
            .add(Task::new("t", TaskPriority::Medium, TaskCategory::Todo))
            .unwrap();
        s.remove(&id).unwrap();
        assert!(s.get(&id).is_none());

        s.add(Task::new("u", TaskPriority::Medium, TaskCategory::Todo))
            .unwrap();
        s.clear().unwrap();
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn test_priority_serde_as_number() {
        let task = Task::new("t", TaskPriority::High, TaskCategory::Goal);
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"priority\":2"));

        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, TaskPriority::High);
    }
}
