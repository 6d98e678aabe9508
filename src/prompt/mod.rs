//! Instruction layering and system prompt management.
//!
//! Four ordered layers with strictly increasing priority: the built-in
//! base prompt, repository instructions, user instructions, and live
//! session instructions. Later layers extend rather than overwrite.
//! [`Manager::effective`] concatenates the enabled layers with section
//! headers; [`Manager::effective_redacted`] additionally masks secret
//! values for display.

pub mod redact;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{BrewolError, Result};

pub use redact::redact_secrets;

/// Repository instruction files probed in order; the first hit wins.
const REPO_INSTRUCTION_FILES: &[&str] = &[".aicoder/system.md", "AGENT.md", "CLAUDE.md"];

/// Instruction layer priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    /// Compiled into the binary.
    Base,
    /// From the workspace instruction file.
    Repo,
    /// From the user config directory.
    User,
    /// Set live through the control surface; not persisted unless saved.
    Session,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Layer::Base => "base",
            Layer::Repo => "repo",
            Layer::User => "user",
            Layer::Session => "session",
        };
        write!(f, "{s}")
    }
}

/// Metadata about one instruction layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub layer: Layer,
    pub content: String,
    /// File path, or "builtin" / "session".
    pub source: String,
    pub enabled: bool,
}

#[derive(Debug, Default)]
struct Layers {
    repo: String,
    repo_source: String,
    user: String,
    user_source: String,
    session: String,
}

/// Manages instruction layers and builds the effective system prompt.
#[derive(Debug)]
pub struct Manager {
    app_name: String,
    workspace_root: PathBuf,
    base: String,
    layers: RwLock<Layers>,
    /// User config dir; injectable for tests.
    config_dir: Option<PathBuf>,
}

impl Manager {
    /// Create a manager, loading repo and user instruction files.
    #[must_use]
    pub fn new(app_name: &str, workspace_root: &Path, project_type: &str) -> Self {
        Self::with_config_dir(app_name, workspace_root, project_type, dirs::config_dir())
    }

    /// Create a manager with an explicit user config directory.
    #[must_use]
    pub fn with_config_dir(
        app_name: &str,
        workspace_root: &Path,
        project_type: &str,
        config_dir: Option<PathBuf>,
    ) -> Self {
        let manager = Self {
            app_name: app_name.to_string(),
            workspace_root: workspace_root.to_path_buf(),
            base: build_base_prompt(workspace_root, project_type),
            layers: RwLock::new(Layers::default()),
            config_dir,
        };
        manager.reload();
        manager
    }

    /// Reload repo and user instructions from disk. The session layer is
    /// untouched.
    pub fn reload(&self) {
        let mut repo = (String::new(), String::new());
        for candidate in REPO_INSTRUCTION_FILES {
            let path = self.workspace_root.join(candidate);
            if let Ok(content) = std::fs::read_to_string(&path) {
                repo = (content, path.display().to_string());
                break;
            }
        }

        let mut user = (String::new(), String::new());
        if let Some(path) = self.user_config_path() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                user = (content, path.display().to_string());
            }
        }

        let mut layers = self.layers.write().expect("prompt lock");
        layers.repo = repo.0;
        layers.repo_source = repo.1;
        layers.user = user.0;
        layers.user_source = user.1;
    }

    /// Path of the user instruction file, if a config dir is known.
    #[must_use]
    pub fn user_config_path(&self) -> Option<PathBuf> {
        self.config_dir
            .as_ref()
            .map(|dir| dir.join(&self.app_name).join("system.md"))
    }

    /// The merged system prompt from all enabled layers.
    #[must_use]
    pub fn effective(&self) -> String {
        let layers = self.layers.read().expect("prompt lock");
        let mut parts = vec![self.base.clone()];

        if !layers.repo.is_empty() {
            parts.push(format!(
                "\n## REPOSITORY INSTRUCTIONS (from {})\n\n{}",
                layers.repo_source, layers.repo
            ));
        }
        if !layers.user.is_empty() {
            parts.push(format!("\n## USER INSTRUCTIONS\n\n{}", layers.user));
        }
        if !layers.session.is_empty() {
            parts.push(format!(
                "\n## SESSION INSTRUCTIONS (active)\n\n{}",
                layers.session
            ));
        }

        parts.join("\n")
    }

    /// The effective prompt with secret values redacted for display.
    #[must_use]
    pub fn effective_redacted(&self) -> String {
        redact_secrets(&self.effective())
    }

    /// Information about every layer.
    #[must_use]
    pub fn layers(&self) -> Vec<LayerInfo> {
        let layers = self.layers.read().expect("prompt lock");
        vec![
            LayerInfo {
                layer: Layer::Base,
                content: self.base.clone(),
                source: "builtin".to_string(),
                enabled: true,
            },
            LayerInfo {
                layer: Layer::Repo,
                content: layers.repo.clone(),
                source: layers.repo_source.clone(),
                enabled: !layers.repo.is_empty(),
            },
            LayerInfo {
                layer: Layer::User,
                content: layers.user.clone(),
                source: layers.user_source.clone(),
                enabled: !layers.user.is_empty(),
            },
            LayerInfo {
                layer: Layer::Session,
                content: layers.session.clone(),
                source: "session".to_string(),
                enabled: !layers.session.is_empty(),
            },
        ]
    }

    /// Set the session-level instructions.
    pub fn set_session_instructions(&self, instructions: impl Into<String>) {
        self.layers.write().expect("prompt lock").session = instructions.into();
    }

    /// Current session instructions.
    #[must_use]
    pub fn session_instructions(&self) -> String {
        self.layers.read().expect("prompt lock").session.clone()
    }

    /// Clear session-level instructions.
    pub fn clear_session_instructions(&self) {
        self.layers.write().expect("prompt lock").session.clear();
    }

    /// Load a file into the session layer. The path must live inside the
    /// workspace or the user config directory.
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };

        let in_workspace = abs.starts_with(&self.workspace_root);
        let in_config = self
            .config_dir
            .as_ref()
            .is_some_and(|dir| abs.starts_with(dir));

        if !in_workspace && !in_config {
            return Err(BrewolError::InstructionPath {
                workspace: self.workspace_root.display().to_string(),
                config: self
                    .config_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
            });
        }

        let content = std::fs::read_to_string(&abs)?;
        self.set_session_instructions(content);
        Ok(())
    }

    /// Persist the session instructions into the user layer.
    pub fn save_session_to_user(&self) -> Result<()> {
        let session = self.session_instructions();
        if session.is_empty() {
            return Err(BrewolError::config("no session instructions to save"));
        }

        let path = self
            .user_config_path()
            .ok_or_else(|| BrewolError::config("no user config directory available"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &session)?;

        let mut layers = self.layers.write().expect("prompt lock");
        layers.user = session;
        layers.user_source = path.display().to_string();
        Ok(())
    }

    /// The workspace root this manager serves.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

/// The built-in base prompt, interpolated with workspace and project type.
fn build_base_prompt(workspace_root: &Path, project_type: &str) -> String {
    format!(
        r#"You are an autonomous coding agent working in {root} ({project_type}).

## CORE PRINCIPLES

1. **TOOL-BASED EVIDENCE**: Every claim about code state must come from tool output.
   - Never claim to have read/written/verified something without tool evidence
   - Always show the actual tool result that proves the claim

2. **OBSERVE-DECIDE-ACT-VERIFY-CHECKPOINT CYCLE**:
   - OBSERVE: Gather context using tools (fs_read, rg_search, git_status, etc.)
   - DECIDE: Plan the next action based on observations
   - ACT: Execute the planned action using appropriate tool
   - VERIFY: Confirm the action succeeded by re-reading or running tests
   - CHECKPOINT: Commit working changes with descriptive message

3. **PATCH-FIRST EDITING**:
   - Prefer fs_patch with unified diffs over fs_write for existing files
   - Always read the file first to understand current state
   - After patching, re-read changed regions to confirm correctness

4. **VERIFICATION BEFORE COMMIT**:
   - Run tests/build before committing
   - Only commit when verification passes
   - If verification fails, fix issues first

5. **ROLLBACK STRATEGY**:
   - If stuck after 3 attempts, consider git reset to last good state
   - Never leave the codebase in a broken state

Be concise. Do one thing at a time.

## AVAILABLE TOOLS

- fs_list: List directory contents
- fs_read: Read file contents
- fs_write: Write new file (use for new files only)
- fs_patch: Apply unified diff (preferred for editing)
- rg_search: Search code with ripgrep
- exec / shell: Execute shell commands
- git_status, git_diff, git_commit, git_reset_hard: Git operations"#,
        root = workspace_root.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> Manager {
        Manager::with_config_dir("brewol", dir.path(), "rust", None)
    }

    #[test]
    fn test_base_prompt_interpolation() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let effective = m.effective();
        assert!(effective.contains(&dir.path().display().to_string()));
        assert!(effective.contains("(rust)"));
        assert!(effective.contains("OBSERVE-DECIDE-ACT-VERIFY-CHECKPOINT"));
    }

    #[test]
    fn test_repo_layer_probe_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENT.md"), "agent rules").unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "claude rules").unwrap();

        let m = manager(&dir);
        let effective = m.effective();
        // AGENT.md beats CLAUDE.md; .aicoder/system.md would beat both.
        assert!(effective.contains("agent rules"));
        assert!(!effective.contains("claude rules"));

        std::fs::create_dir_all(dir.path().join(".aicoder")).unwrap();
        std::fs::write(dir.path().join(".aicoder/system.md"), "aicoder rules").unwrap();
        m.reload();
        assert!(m.effective().contains("aicoder rules"));
    }

    #[test]
    fn test_user_layer_loaded_from_config_dir() {
        let ws = TempDir::new().unwrap();
        let cfg = TempDir::new().unwrap();
        std::fs::create_dir_all(cfg.path().join("brewol")).unwrap();
        std::fs::write(cfg.path().join("brewol/system.md"), "user prefs").unwrap();

        let m = Manager::with_config_dir("brewol", ws.path(), "go", Some(cfg.path().into()));
        assert!(m.effective().contains("## USER INSTRUCTIONS"));
        assert!(m.effective().contains("user prefs"));
    }

    #[test]
    fn test_session_layer_set_and_clear() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);

        m.set_session_instructions("focus on tests");
        assert!(m.effective().contains("SESSION INSTRUCTIONS"));
        assert!(m.effective().contains("focus on tests"));

        m.clear_session_instructions();
        assert!(!m.effective().contains("SESSION INSTRUCTIONS"));
    }

    #[test]
    fn test_layers_ordering_later_extends() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENT.md"), "repo layer").unwrap();
        let m = manager(&dir);
        m.set_session_instructions("session layer");

        let effective = m.effective();
        let repo_at = effective.find("repo layer").unwrap();
        let session_at = effective.find("session layer").unwrap();
        assert!(repo_at < session_at);
    }

    #[test]
    fn test_effective_redacted_masks_values() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.set_session_instructions("api_key: abcdef0123456789abcdef0123");

        let redacted = m.effective_redacted();
        assert!(redacted.contains("api_key: "));
        assert!(redacted.contains("[REDACTED]"));
        assert!(!redacted.contains("abcdef0123456789abcdef0123"));
    }

    #[test]
    fn test_load_from_file_containment() {
        let ws = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("evil.md"), "injected").unwrap();
        std::fs::write(ws.path().join("ok.md"), "workspace instructions").unwrap();

        let m = manager(&ws);
        assert!(m.load_from_file(&outside.path().join("evil.md")).is_err());

        m.load_from_file(&ws.path().join("ok.md")).unwrap();
        assert_eq!(m.session_instructions(), "workspace instructions");
    }

    #[test]
    fn test_save_session_to_user() {
        let ws = TempDir::new().unwrap();
        let cfg = TempDir::new().unwrap();
        let m = Manager::with_config_dir("brewol", ws.path(), "rust", Some(cfg.path().into()));

        assert!(m.save_session_to_user().is_err());

        m.set_session_instructions("keep these");
        m.save_session_to_user().unwrap();

        let saved = std::fs::read_to_string(cfg.path().join("brewol/system.md")).unwrap();
        assert_eq!(saved, "keep these");

        let layers = m.layers();
        let user = layers.iter().find(|l| l.layer == Layer::User).unwrap();
        assert!(user.enabled);
        assert_eq!(user.content, "keep these");
    }

    #[test]
    fn test_layer_display() {
        assert_eq!(Layer::Base.to_string(), "base");
        assert_eq!(Layer::Session.to_string(), "session");
    }
}
