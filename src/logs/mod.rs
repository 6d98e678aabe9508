//! Session logging: append-only JSONL streams per session.
//!
//! Each session gets a timestamped directory under
//! `<workspace>/.brewol/logs/` holding three JSONL files (`transcript`,
//! `tools`, `thinking`) and a `patches/` subdirectory for saved diffs.
//! Writes are serialized under a per-session lock; flushes are
//! best-effort. A closed session cannot be reopened and double-close is
//! idempotent.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrewolError, Result};

/// One log entry. `entry_type` is the message role (`user`, `assistant`,
/// `checkpoint`, `objective`), `tool:<name>`, or `thinking`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

struct Files {
    transcript: File,
    tools: File,
    thinking: File,
}

/// A logging session backed by append-only JSONL files.
pub struct Session {
    id: String,
    log_dir: PathBuf,
    files: Mutex<Option<Files>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl Session {
    /// Create a new session under `<workspace>/.brewol/logs/<timestamp>/`.
    pub fn new(workspace_root: &Path) -> Result<Self> {
        let id = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let log_dir = workspace_root.join(".brewol").join("logs").join(&id);
        fs::create_dir_all(&log_dir)?;

        let open = |name: &str| -> Result<File> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_dir.join(name))
                .map_err(Into::into)
        };

        Ok(Self {
            id,
            log_dir: log_dir.clone(),
            files: Mutex::new(Some(Files {
                transcript: open("transcript.jsonl")?,
                tools: open("tools.jsonl")?,
                thinking: open("thinking.jsonl")?,
            })),
        })
    }

    /// Session identifier (the directory timestamp).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Log directory for this session.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.log_dir
    }

    fn append(&self, select: impl Fn(&mut Files) -> &mut File, entry: &Entry) -> Result<()> {
        let mut guard = self.files.lock().expect("session lock");
        let files = guard.as_mut().ok_or(BrewolError::SessionClosed)?;
        let mut data = serde_json::to_vec(entry)?;
        data.push(b'\n');
        let file = select(files);
        file.write_all(&data)?;
        let _ = file.flush();
        Ok(())
    }

    /// Log a conversation message to the transcript.
    pub fn log_message(
        &self,
        role: &str,
        content: &str,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<()> {
        self.append(
            |f| &mut f.transcript,
            &Entry {
                timestamp: Utc::now(),
                entry_type: role.to_string(),
                content: content.to_string(),
                metadata,
            },
        )
    }

    /// Log a thinking trace with its cycle and duration.
    pub fn log_thinking(&self, cycle_id: u64, thinking: &str, duration_ms: i64) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("cycle_id".to_string(), Value::from(cycle_id));
        metadata.insert("duration_ms".to_string(), Value::from(duration_ms));
        metadata.insert("length".to_string(), Value::from(thinking.len()));

        self.append(
            |f| &mut f.thinking,
            &Entry {
                timestamp: Utc::now(),
                entry_type: "thinking".to_string(),
                content: thinking.to_string(),
                metadata: Some(metadata),
            },
        )
    }

    /// Log a tool execution.
    pub fn log_tool_call(
        &self,
        name: &str,
        args: &str,
        output: &str,
        duration_seconds: f64,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("args".to_string(), Value::from(args));
        metadata.insert("duration".to_string(), Value::from(duration_seconds));
        metadata.insert("exit_code".to_string(), Value::from(exit_code));
        if let Some(error) = error {
            metadata.insert("error".to_string(), Value::from(error));
        }

        self.append(
            |f| &mut f.tools,
            &Entry {
                timestamp: Utc::now(),
                entry_type: format!("tool:{name}"),
                content: output.to_string(),
                metadata: Some(metadata),
            },
        )
    }

    /// Log a checkpoint event with its commit SHA.
    pub fn log_checkpoint(&self, commit_sha: &str, message: &str) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("commit".to_string(), Value::from(commit_sha));
        self.log_message("checkpoint", message, Some(metadata))
    }

    /// Log an objective start/complete event.
    pub fn log_objective(&self, objective: &str, status: &str) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("status".to_string(), Value::from(status));
        self.log_message("objective", objective, Some(metadata))
    }

    /// Save a patch under the session's `patches/` directory.
    pub fn save_patch(&self, name: &str, content: &str) -> Result<PathBuf> {
        let patch_dir = self.log_dir.join("patches");
        fs::create_dir_all(&patch_dir)?;

        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let patch_file = patch_dir.join(format!("{name}-{nanos}.patch"));
        fs::write(&patch_file, content)?;
        Ok(patch_file)
    }

    /// Close the session. Idempotent; later writes fail with
    /// [`BrewolError::SessionClosed`].
    pub fn close(&self) {
        let mut guard = self.files.lock().expect("session lock");
        if let Some(files) = guard.take() {
            drop(files);
        }
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.files.lock().expect("session lock").is_none()
    }
}

/// Default log directory for a workspace.
#[must_use]
pub fn default_log_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".brewol").join("logs")
}

/// List previous session IDs (directory names) for a workspace.
pub fn list_sessions(workspace_root: &Path) -> Result<Vec<String>> {
    let log_dir = default_log_dir(workspace_root);
    let entries = match fs::read_dir(&log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut sessions: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    sessions.sort();
    Ok(sessions)
}

/// Read all entries from a session directory's transcript.
pub fn read_transcript(session_dir: &Path) -> Result<Vec<Entry>> {
    let content = fs::read_to_string(session_dir.join("transcript.jsonl"))?;
    Ok(content
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
