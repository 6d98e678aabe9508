//! Rolling memory: durable compact facts persisted across sessions.
//!
//! The [`Manager`] owns the `WorkingMemory` record at
//! `<workspace>/.brewol/memory/working_memory.json` and two per-session
//! JSONL logs. Memory is rebuilt into a small markdown block appended to
//! the system prompt, so successive prompts stay small yet informed.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Default number of cycles between periodic memory saves.
pub const DEFAULT_UPDATE_INTERVAL: u32 = 5;

/// Memory manager configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub workspace_root: PathBuf,
    /// Save memory every N completed cycles.
    pub update_interval: u32,
}

impl MemoryConfig {
    /// Default configuration for a workspace.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

/// The compact memory blob fed to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingMemory {
    // Project info
    #[serde(default)]
    pub project_type: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub key_directories: Vec<String>,
    #[serde(default)]
    pub key_modules: Vec<String>,

    // Conventions
    #[serde(default)]
    pub conventions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,

    // Current state
    #[serde(default)]
    pub current_branch: String,
    #[serde(default)]
    pub last_good_commit: String,
    #[serde(default)]
    pub last_good_command: String,

    // Backlog summary
    #[serde(default)]
    pub backlog_summary: Vec<String>,

    // Session metadata
    #[serde(default)]
    pub cycle_count: u64,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub update_reason: String,
}

impl WorkingMemory {
    /// A record with nothing worth showing the model.
    #[must_use]
    pub fn is_vacuous(&self) -> bool {
        self.project_type.is_empty() && self.build_command.is_empty()
    }
}

struct Inner {
    memory: WorkingMemory,
    cycles_since_update: u32,
    transcript: Option<File>,
    full_log: Option<File>,
}

/// Manages rolling memory for agent sessions.
pub struct Manager {
    config: MemoryConfig,
    memory_file: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("memory_file", &self.memory_file)
            .finish()
    }
}

/// A log entry for the per-session transcript files.
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    entry_type: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<HashMap<String, Value>>,
}

impl Manager {
    /// Create a manager, loading any existing memory from disk and
    /// opening fresh per-session log files.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let mem_dir = config.workspace_root.join(".brewol").join("memory");
        fs::create_dir_all(&mem_dir)?;

        let memory_file = mem_dir.join("working_memory.json");
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        let transcript = File::create(mem_dir.join(format!("transcript_{timestamp}.jsonl")))?;
        let full_log = File::create(mem_dir.join(format!("full_log_{timestamp}.jsonl")))?;

        let memory = load_memory(&memory_file);

        Ok(Self {
            config,
            memory_file,
            inner: Mutex::new(Inner {
                memory,
                cycles_since_update: 0,
                transcript: Some(transcript),
                full_log: Some(full_log),
            }),
        })
    }

    /// A copy of the current memory record.
    #[must_use]
    pub fn working_memory(&self) -> WorkingMemory {
        self.inner.lock().expect("memory lock").memory.clone()
    }

    /// Markdown view of the memory, or the empty string when vacuous.
    #[must_use]
    pub fn text(&self) -> String {
        let inner = self.inner.lock().expect("memory lock");
        let m = &inner.memory;
        if m.is_vacuous() {
            return String::new();
        }

        let mut b = String::from("## WORKING MEMORY\n\n");

        if !m.project_type.is_empty() {
            b.push_str(&format!("**Project Type:** {}\n", m.project_type));
        }
        if !m.build_command.is_empty() {
            b.push_str(&format!("**Build Command:** `{}`\n", m.build_command));
        }
        if !m.test_command.is_empty() {
            b.push_str(&format!("**Test Command:** `{}`\n", m.test_command));
        }
        if !m.key_directories.is_empty() {
            b.push_str(&format!(
                "**Key Directories:** {}\n",
                m.key_directories.join(", ")
            ));
        }
        if !m.key_modules.is_empty() {
            b.push_str(&format!("**Key Modules:** {}\n", m.key_modules.join(", ")));
        }

        if !m.conventions.is_empty() {
            b.push_str("\n**Conventions:**\n");
            for c in &m.conventions {
                b.push_str(&format!("- {c}\n"));
            }
        }
        if !m.constraints.is_empty() {
            b.push_str("\n**Constraints:**\n");
            for c in &m.constraints {
                b.push_str(&format!("- {c}\n"));
            }
        }

        if !m.current_branch.is_empty() {
            b.push_str(&format!("\n**Current Branch:** {}\n", m.current_branch));
        }
        if !m.last_good_commit.is_empty() {
            b.push_str(&format!("**Last Good Commit:** {}\n", m.last_good_commit));
        }
        if !m.last_good_command.is_empty() {
            b.push_str(&format!("**Last Good Command:** `{}`\n", m.last_good_command));
        }

        if !m.backlog_summary.is_empty() {
            b.push_str("\n**Active Backlog:**\n");
            for (i, item) in m.backlog_summary.iter().enumerate() {
                if i >= 5 {
                    b.push_str(&format!(
                        "- ... and {} more\n",
                        m.backlog_summary.len() - 5
                    ));
                    break;
                }
                b.push_str(&format!("- {item}\n"));
            }
        }

        b.push_str(&format!(
            "\n*Memory updated: {} (cycle {})*\n",
            m.last_updated.with_timezone(&Local).format("%H:%M:%S"),
            m.cycle_count
        ));

        b
    }

    /// Set project information.
    pub fn set_project_info(&self, project_type: &str, build_cmd: &str, test_cmd: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        inner.memory.project_type = project_type.to_string();
        inner.memory.build_command = build_cmd.to_string();
        inner.memory.test_command = test_cmd.to_string();
    }

    /// Set key directories.
    pub fn set_key_directories(&self, dirs: Vec<String>) {
        self.inner.lock().expect("memory lock").memory.key_directories = dirs;
    }

    /// Set key modules.
    pub fn set_key_modules(&self, modules: Vec<String>) {
        self.inner.lock().expect("memory lock").memory.key_modules = modules;
    }

    /// Add a convention. Duplicates are ignored.
    pub fn add_convention(&self, convention: impl Into<String>) {
        let convention = convention.into();
        let mut inner = self.inner.lock().expect("memory lock");
        if !inner.memory.conventions.contains(&convention) {
            inner.memory.conventions.push(convention);
        }
    }

    /// Add a constraint. Duplicates are ignored.
    pub fn add_constraint(&self, constraint: impl Into<String>) {
        let constraint = constraint.into();
        let mut inner = self.inner.lock().expect("memory lock");
        if !inner.memory.constraints.contains(&constraint) {
            inner.memory.constraints.push(constraint);
        }
    }

    /// Set git state. An empty commit leaves the previous one in place.
    pub fn set_git_state(&self, branch: &str, last_good_commit: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        inner.memory.current_branch = branch.to_string();
        if !last_good_commit.is_empty() {
            inner.memory.last_good_commit = last_good_commit.to_string();
        }
    }

    /// Set the last successful command.
    pub fn set_last_good_command(&self, cmd: &str) {
        self.inner.lock().expect("memory lock").memory.last_good_command = cmd.to_string();
    }

    /// Replace the backlog summary.
    pub fn set_backlog_summary(&self, items: Vec<String>) {
        self.inner.lock().expect("memory lock").memory.backlog_summary = items;
    }

    /// Push one line onto the backlog summary. Duplicates are ignored.
    pub fn push_backlog_summary(&self, item: impl Into<String>) {
        let item = item.into();
        let mut inner = self.inner.lock().expect("memory lock");
        if !inner.memory.backlog_summary.contains(&item) {
            inner.memory.backlog_summary.push(item);
        }
    }

    /// Append a message to the full session log.
    pub fn log_message(&self, role: &str, content: &str) -> Result<()> {
        self.append_full_log(LogEntry {
            timestamp: Utc::now(),
            entry_type: role.to_string(),
            content: content.to_string(),
            metadata: None,
        })
    }

    /// Append a tool call to the full session log.
    pub fn log_tool_call(
        &self,
        name: &str,
        args: &str,
        output: &str,
        exit_code: i32,
        duration: f64,
    ) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("args".to_string(), Value::from(args));
        metadata.insert("exit_code".to_string(), Value::from(exit_code));
        metadata.insert("duration".to_string(), Value::from(duration));

        self.append_full_log(LogEntry {
            timestamp: Utc::now(),
            entry_type: format!("tool:{name}"),
            content: output.to_string(),
            metadata: Some(metadata),
        })
    }

    fn append_full_log(&self, entry: LogEntry) -> Result<()> {
        let mut data = serde_json::to_vec(&entry)?;
        data.push(b'\n');

        let mut inner = self.inner.lock().expect("memory lock");
        if let Some(file) = inner.full_log.as_mut() {
            file.write_all(&data)?;
        }
        Ok(())
    }

    /// Called after each agent cycle. Returns `true` exactly when the
    /// running count reached the update interval, in which case the memory
    /// was saved with reason `periodic`.
    pub fn on_cycle_complete(&self, cycle_num: u64) -> bool {
        let should_update = {
            let mut inner = self.inner.lock().expect("memory lock");
            inner.cycles_since_update += 1;
            inner.memory.cycle_count = cycle_num;
            inner.cycles_since_update >= self.config.update_interval
        };

        if should_update {
            self.trigger_update("periodic");
        }
        should_update
    }

    /// Called after a successful checkpoint commit.
    pub fn on_checkpoint(&self, commit_sha: &str) {
        {
            let mut inner = self.inner.lock().expect("memory lock");
            inner.memory.last_good_commit = commit_sha.to_string();
        }
        self.trigger_update("checkpoint");
    }

    /// Called after a significant failure.
    pub fn on_significant_failure(&self, reason: &str) {
        self.trigger_update(&format!("failure: {reason}"));
    }

    /// Save the memory with the given reason and reset the cycle counter.
    pub fn trigger_update(&self, reason: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("memory lock");
            inner.memory.update_reason = reason.to_string();
            inner.memory.last_updated = Utc::now();
            inner.cycles_since_update = 0;
            inner.memory.clone()
        };

        if let Err(e) = save_memory(&self.memory_file, &snapshot) {
            warn!("failed to save working memory: {e}");
        }
    }

    /// Zero the record. Logs on disk are kept.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock().expect("memory lock");
            inner.memory = WorkingMemory {
                last_updated: Utc::now(),
                update_reason: "reset".to_string(),
                ..WorkingMemory::default()
            };
            inner.cycles_since_update = 0;
        }
        let snapshot = self.working_memory();
        if let Err(e) = save_memory(&self.memory_file, &snapshot) {
            warn!("failed to save working memory: {e}");
        }
    }

    /// Close log files and do a final save.
    pub fn close(&self) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("memory lock");
            inner.transcript.take();
            inner.full_log.take();
            inner.memory.clone()
        };
        if let Err(e) = save_memory(&self.memory_file, &snapshot) {
            warn!("failed to save working memory on close: {e}");
        }
    }

    /// The memory directory path.
    #[must_use]
    pub fn memory_dir(&self) -> PathBuf {
        self.memory_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

fn load_memory(path: &Path) -> WorkingMemory {
    match fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!("corrupted working memory at {}: {e}; starting fresh", path.display());
            WorkingMemory {
                last_updated: Utc::now(),
                ..WorkingMemory::default()
            }
        }),
        Err(_) => WorkingMemory {
            last_updated: Utc::now(),
            ..WorkingMemory::default()
        },
    }
}

fn save_memory(path: &Path, memory: &WorkingMemory) -> Result<()> {
    let lock_path = path.with_extension("json.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    FileExt::lock_exclusive(&lock_file)?;

    let data = serde_json::to_string_pretty(memory)?;
    let result = fs::write(path, data);
    let _ = FileExt::unlock(&lock_file);
    result.map_err(Into::into)
}

/// Prompt for the memory summariser model.
#[must_use]
pub fn summarizer_prompt(recent_activity: &str) -> String {
    format!(
        r#"You are a memory summarizer. Given the recent activity, extract ONLY durable facts that should be remembered.

RECENT ACTIVITY:
{recent_activity}

OUTPUT FORMAT (JSON):
{{
  "project_type": "type if discovered",
  "build_command": "command if discovered",
  "test_command": "command if discovered",
  "key_directories": ["dir1", "dir2"],
  "key_modules": ["mod1", "mod2"],
  "conventions": ["convention1"],
  "constraints": ["constraint1"],
  "backlog_summary": ["item1", "item2"]
}}

RULES:
- Only include fields with confirmed information
- Keep entries concise (max 50 chars each)
- Max 5 items per array
- Focus on durable truths, not temporary state"#
    )
}

/// Fallback summary built from tool logs and git state when no
/// summariser model is available.
#[must_use]
pub fn deterministic_summary(
    project_type: &str,
    build_cmd: &str,
    test_cmd: &str,
    branch: &str,
    dirty_files: &[String],
) -> WorkingMemory {
    let mut memory = WorkingMemory {
        project_type: project_type.to_string(),
        build_command: build_cmd.to_string(),
        test_command: test_cmd.to_string(),
        current_branch: branch.to_string(),
        last_updated: Utc::now(),
        update_reason: "deterministic-fallback".to_string(),
        ..WorkingMemory::default()
    };

    for file in dirty_files.iter().take(5) {
        memory.backlog_summary.push(format!("Uncommitted: {file}"));
    }

    memory
}
