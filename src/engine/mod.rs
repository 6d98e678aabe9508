//! The autonomous cycle engine.
//!
//! One dedicated task runs the observe -> decide -> execute -> compact ->
//! bookkeep loop and exclusively owns the conversation. The public
//! control surface is an [`EngineHandle`]: cheap setters flip shared
//! flags, heavier operations (checkpoint, rollback, forced compaction)
//! are enqueued as commands and drained between cycles, so nothing ever
//! blocks the loop and no lock is held across I/O.
//!
//! # Cancellation
//!
//! A master token ends the engine; each cycle derives a child token that
//! [`EngineHandle::cancel_current`] fires to drop only the in-flight
//! context. A cancelled cycle resets the consecutive-error counter and
//! the loop continues with fresh context.

pub mod backlog;
pub mod bus;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Local;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::budget::{BudgetConfig, BudgetManager, BudgetState};
use crate::context::compactor::{Compactor, CompactorConfig, RollingMemoryUpdate, ToolOutput};
use crate::context::taskbrief::{BriefLevel, TaskBriefGenerator};
use crate::context::taskstore::TaskStore;
use crate::context::estimate_tokens;
use crate::error::{BrewolError, Result};
use crate::llm::{ChatMessage, Client, Role, ToolCall};
use crate::logs::Session;
use crate::memory::{Manager as MemoryManager, MemoryConfig};
use crate::prompt::Manager as PromptManager;
use crate::repo::{detect_project, failing_tests, scan_for_todos, Project, Verifier};
use crate::tools::{git, Registry, ToolResult};

pub use backlog::{BacklogItem, Suggestion, SuggestionStatus};
pub use bus::UpdateBus;

/// Sleep while paused between polls.
const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Sleep between cycles.
const INTER_CYCLE_SLEEP: Duration = Duration::from_secs(2);

/// Sleep while waiting for a goal or model.
const WAITING_SLEEP: Duration = Duration::from_secs(2);

/// Consecutive errors before the loop auto-pauses.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Sleep that ends early (with [`BrewolError::Cancelled`]) when the
/// cycle token fires.
async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BrewolError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Engine state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Observing,
    Deciding,
    Executing,
    Verifying,
    Committing,
    Recovering,
    Terminating,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Observing => "OBSERVING",
            Self::Deciding => "DECIDING",
            Self::Executing => "EXECUTING",
            Self::Verifying => "VERIFYING",
            Self::Committing => "COMMITTING",
            Self::Recovering => "RECOVERING",
            Self::Terminating => "TERMINATING",
        };
        write!(f, "{s}")
    }
}

/// One update delivered to the UI.
#[derive(Debug)]
pub enum CycleUpdate {
    /// The engine entered a phase.
    StateChange { state: EngineState, message: String },
    /// An informational line within the current phase.
    Message { state: EngineState, message: String },
    /// A streamed content fragment.
    TokenContent { content: String, tokens_per_sec: f64 },
    /// A streamed thinking fragment (never enters the conversation).
    ThinkingContent { content: String },
    /// Token-rate refresh without content.
    TokensPerSec { tokens_per_sec: f64 },
    /// A completed tool execution.
    ToolResult { result: ToolResult },
    /// Parsed model suggestions.
    Suggestions { suggestions: Vec<Suggestion> },
    /// An error surfaced to the user.
    Error { message: String },
}

/// Operational summary for status displays.
#[derive(Debug, Clone)]
pub struct Summary {
    pub current_objective: String,
    pub current_state: String,
    pub current_goal: String,
    pub cycle_count: u64,
    pub last_verification_ok: bool,
    pub current_branch: String,
    pub dirty_files: Vec<String>,
    pub backlog_items: Vec<String>,
    pub is_paused: bool,
    pub error_count: u32,
    pub last_error: String,
}

/// Commands drained by the loop between cycles.
#[derive(Debug)]
enum EngineCommand {
    Checkpoint { message: String },
    Rollback,
    ForceCompact,
    RefreshBacklog,
    SetSessionInstructions(String),
    ClearSessionInstructions,
    ResetMemory,
}

#[derive(Debug)]
struct ControlState {
    state: EngineState,
    goal: String,
    objective: String,
    speed_secs: u64,
    paused: bool,
    error_count: u32,
    last_error: String,
    cycle_count: u64,
    last_verify_ok: bool,
    backlog: Vec<BacklogItem>,
    cycle_cancel: CancellationToken,
}

impl ControlState {
    fn new(goal: Option<String>) -> Self {
        Self {
            state: EngineState::Observing,
            goal: goal.unwrap_or_default(),
            objective: String::new(),
            speed_secs: 0,
            paused: false,
            error_count: 0,
            last_error: String::new(),
            cycle_count: 0,
            last_verify_ok: false,
            backlog: Vec::new(),
            cycle_cancel: CancellationToken::new(),
        }
    }
}

/// Thread-safe control surface over a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    control: Arc<RwLock<ControlState>>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    master: CancellationToken,
    client: Arc<Client>,
    prompt: Arc<PromptManager>,
    memory: Arc<MemoryManager>,
    budget: Arc<BudgetManager>,
    tasks: Arc<TaskStore>,
    project: Project,
    session_path: PathBuf,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &self.state())
            .field("session_path", &self.session_path)
            .finish()
    }
}

impl EngineHandle {
    /// Set the user goal and queue it on the backlog at priority 1.
    pub fn set_goal(&self, goal: &str) {
        let mut control = self.control.write().expect("engine lock");
        control.goal = goal.to_string();
        backlog::insert(
            &mut control.backlog,
            BacklogItem::new("goal", goal, 1, "user"),
        );
    }

    /// Set the inter-cycle throttle in seconds (0 = none).
    pub fn set_speed(&self, seconds: u64) {
        self.control.write().expect("engine lock").speed_secs = seconds;
    }

    /// Pause the loop after the current cycle.
    pub fn pause(&self) {
        self.control.write().expect("engine lock").paused = true;
    }

    /// Resume a paused loop.
    pub fn resume(&self) {
        self.control.write().expect("engine lock").paused = false;
    }

    /// Whether the loop is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.control.read().expect("engine lock").paused
    }

    /// Cancel the in-flight cycle. The loop continues with fresh context.
    pub fn cancel_current(&self) {
        self.control.read().expect("engine lock").cycle_cancel.cancel();
    }

    /// Stop the engine. The loop transitions to Terminating and exits.
    pub fn stop(&self) {
        self.master.cancel();
    }

    /// Request a manual checkpoint commit.
    pub fn checkpoint(&self) {
        let _ = self.commands.send(EngineCommand::Checkpoint {
            message: "Manual checkpoint".to_string(),
        });
    }

    /// Request a rollback to the previous commit.
    pub fn rollback(&self) {
        let _ = self.commands.send(EngineCommand::Rollback);
    }

    /// Request an immediate compaction pass.
    pub fn force_compact(&self) {
        let _ = self.commands.send(EngineCommand::ForceCompact);
    }

    /// Request a backlog refresh (TODO scan + failing tests).
    pub fn refresh_backlog(&self) {
        let _ = self.commands.send(EngineCommand::RefreshBacklog);
    }

    /// Set session-level instructions and rebuild the system prompt.
    pub fn set_session_instructions(&self, instructions: &str) {
        let _ = self
            .commands
            .send(EngineCommand::SetSessionInstructions(instructions.to_string()));
    }

    /// Clear session-level instructions and rebuild the system prompt.
    pub fn clear_session_instructions(&self) {
        let _ = self.commands.send(EngineCommand::ClearSessionInstructions);
    }

    /// Persist session instructions into the user layer.
    pub fn save_session_instructions(&self) -> Result<()> {
        self.prompt.save_session_to_user()
    }

    /// Reset the working memory (logs on disk are kept).
    pub fn reset_memory(&self) {
        let _ = self.commands.send(EngineCommand::ResetMemory);
    }

    /// Re-sync the budget with the client's effective context size.
    /// Call after selecting a model.
    pub fn sync_context_size(&self) {
        self.budget.set_num_ctx(self.client.model_context_size());
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.control.read().expect("engine lock").state
    }

    /// Current objective.
    #[must_use]
    pub fn objective(&self) -> String {
        self.control.read().expect("engine lock").objective.clone()
    }

    /// Current goal.
    #[must_use]
    pub fn goal(&self) -> String {
        self.control.read().expect("engine lock").goal.clone()
    }

    /// A copy of the backlog, priority order.
    #[must_use]
    pub fn backlog(&self) -> Vec<BacklogItem> {
        self.control.read().expect("engine lock").backlog.clone()
    }

    /// Completed cycle count.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.control.read().expect("engine lock").cycle_count
    }

    /// Current context budget snapshot.
    #[must_use]
    pub fn context_state(&self) -> BudgetState {
        self.budget.state()
    }

    /// The effective system prompt, redacted for display.
    #[must_use]
    pub fn effective_system_prompt(&self) -> String {
        self.prompt.effective_redacted()
    }

    /// The working memory markdown block.
    #[must_use]
    pub fn working_memory_text(&self) -> String {
        self.memory.text()
    }

    /// The LLM client, for model selection and probes.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The task store.
    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Session log directory.
    #[must_use]
    pub fn session_path(&self) -> &PathBuf {
        &self.session_path
    }

    /// Operational summary for status displays.
    #[must_use]
    pub fn summary(&self) -> Summary {
        let control = self.control.read().expect("engine lock");
        Summary {
            current_objective: control.objective.clone(),
            current_state: control.state.to_string(),
            current_goal: control.goal.clone(),
            cycle_count: control.cycle_count,
            last_verification_ok: control.last_verify_ok,
            current_branch: git::current_branch(&self.project.root),
            dirty_files: git::dirty_files(&self.project.root),
            backlog_items: control
                .backlog
                .iter()
                .take(5)
                .map(|item| item.description.clone())
                .collect(),
            is_paused: control.paused,
            error_count: control.error_count,
            last_error: control.last_error.clone(),
        }
    }
}

/// The autonomous agent engine. Construct with [`Engine::new`], then
/// [`Engine::spawn`] to start the loop and obtain the control handle.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    client: Arc<Client>,
    registry: Arc<Registry>,
    project: Project,
    verifier: Verifier,
    session: Arc<Session>,
    prompt: Arc<PromptManager>,
    memory: Arc<MemoryManager>,
    budget: Arc<BudgetManager>,
    compactor: Compactor,
    tasks: Arc<TaskStore>,
    control: Arc<RwLock<ControlState>>,
    commands_tx: mpsc::UnboundedSender<EngineCommand>,
    commands_rx: mpsc::UnboundedReceiver<EngineCommand>,
    bus: UpdateBus,
    updates_rx: Option<mpsc::Receiver<CycleUpdate>>,
    master: CancellationToken,
    messages: Vec<ChatMessage>,
}

impl Engine {
    /// Wire up an engine for the configured workspace.
    pub fn new(config: Config) -> Result<Self> {
        let root = &config.workspace_root;
        if !root.is_dir() {
            return Err(BrewolError::Workspace {
                path: root.clone(),
                message: "not a directory".to_string(),
            });
        }

        let client = Arc::new(Client::new(config.llm.clone()));
        let registry = Arc::new(Registry::new(root));
        let project = detect_project(root);
        let verifier = Verifier::new(project.clone());
        let session = Arc::new(Session::new(root)?);
        let prompt = Arc::new(PromptManager::new(
            "brewol",
            root,
            &project.project_type.to_string(),
        ));

        let memory = Arc::new(MemoryManager::new(MemoryConfig::new(root))?);
        memory.set_project_info(
            &project.project_type.to_string(),
            &project.build_command,
            &project.test_command,
        );

        let budget = Arc::new(BudgetManager::new(BudgetConfig {
            num_ctx: client.model_context_size(),
            ..BudgetConfig::default()
        }));
        let compactor = Compactor::new(CompactorConfig::new(root))?;
        let tasks = Arc::new(TaskStore::new(root)?);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (bus, updates_rx) = UpdateBus::new();

        Ok(Self {
            control: Arc::new(RwLock::new(ControlState::new(config.goal.clone()))),
            config,
            client,
            registry,
            project,
            verifier,
            session,
            prompt,
            memory,
            budget,
            compactor,
            tasks,
            commands_tx,
            commands_rx,
            bus,
            updates_rx: Some(updates_rx),
            master: CancellationToken::new(),
            messages: Vec::new(),
        })
    }

    /// Build the control handle without starting the loop. Used by the
    /// loop itself and by tests that drive phases directly.
    fn handle(&self) -> EngineHandle {
        EngineHandle {
            control: Arc::clone(&self.control),
            commands: self.commands_tx.clone(),
            master: self.master.clone(),
            client: Arc::clone(&self.client),
            prompt: Arc::clone(&self.prompt),
            memory: Arc::clone(&self.memory),
            budget: Arc::clone(&self.budget),
            tasks: Arc::clone(&self.tasks),
            project: self.project.clone(),
            session_path: self.session.path().to_path_buf(),
        }
    }

    /// Start the loop. Returns the control handle and the update stream.
    #[must_use]
    pub fn spawn(mut self) -> (EngineHandle, mpsc::Receiver<CycleUpdate>) {
        let handle = self.handle();
        let updates_rx = self.updates_rx.take().expect("spawn called once");
        tokio::spawn(async move {
            self.run().await;
        });
        (handle, updates_rx)
    }

    // =========================================================================
    // Loop
    // =========================================================================

    async fn run(mut self) {
        self.initialize_session().await;

        loop {
            if self.master.is_cancelled() {
                self.set_state(EngineState::Terminating);
                self.bus.send(CycleUpdate::StateChange {
                    state: EngineState::Terminating,
                    message: "Shutting down...".to_string(),
                });
                break;
            }

            self.drain_commands().await;

            if self.is_paused() {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }

            let speed = self.control.read().expect("engine lock").speed_secs;
            if speed > 0 {
                tokio::time::sleep(Duration::from_secs(speed)).await;
            }

            let cycle_cancel = self.master.child_token();
            self.control.write().expect("engine lock").cycle_cancel = cycle_cancel.clone();

            match self.run_cycle(&cycle_cancel).await {
                Ok(()) => {
                    let cycle_count = {
                        let mut control = self.control.write().expect("engine lock");
                        control.error_count = 0;
                        control.cycle_count += 1;
                        control.cycle_count
                    };

                    if self.config.test_mode && cycle_count >= u64::from(self.config.max_cycles) {
                        info!("test mode: reached {cycle_count} cycles, terminating");
                        self.master.cancel();
                    }
                }
                Err(e) if e.is_cancellation() || cycle_cancel.is_cancelled() => {
                    if self.master.is_cancelled() {
                        continue; // terminating; top of loop handles it
                    }
                    self.messages.truncate(1); // fresh context, system message kept
                    self.control.write().expect("engine lock").error_count = 0;
                    self.set_state(EngineState::Observing);
                    self.bus.send(CycleUpdate::StateChange {
                        state: EngineState::Observing,
                        message: "Operation cancelled, continuing...".to_string(),
                    });
                }
                Err(e) => self.handle_cycle_error(e).await,
            }
        }

        self.session.close();
        self.memory.close();
        // Dropping self closes the update bus exactly once.
    }

    async fn handle_cycle_error(&mut self, error: BrewolError) {
        let message = error.to_string();
        self.control.write().expect("engine lock").last_error = message.clone();

        // Rate limits do not count toward the hard threshold; the pause
        // itself is the recovery gate.
        if error.is_rate_limit() {
            self.set_state(EngineState::Recovering);
            self.bus.send(CycleUpdate::Error {
                message: format!("{message}\nRATE LIMITED - Auto-pausing. Use /resume when ready."),
            });
            self.pause_internal();
            return;
        }

        let error_count = {
            let mut control = self.control.write().expect("engine lock");
            control.error_count += 1;
            control.error_count
        };

        if error_count >= MAX_CONSECUTIVE_ERRORS {
            self.recover().await;
            self.bus.send(CycleUpdate::Error {
                message: format!(
                    "Too many errors ({error_count}). Auto-pausing. Use /resume to retry."
                ),
            });
            self.memory.on_significant_failure(&message);
            self.pause_internal();
            return;
        }

        let backoff = Duration::from_secs(u64::from(error_count * error_count));
        self.set_state(EngineState::Recovering);
        self.bus.send(CycleUpdate::Error {
            message: format!(
                "Error {error_count}/{MAX_CONSECUTIVE_ERRORS}: {message}. Retrying in {}s...",
                backoff.as_secs()
            ),
        });
        tokio::time::sleep(backoff).await;
    }

    fn pause_internal(&self) {
        self.control.write().expect("engine lock").paused = true;
    }

    fn is_paused(&self) -> bool {
        self.control.read().expect("engine lock").paused
    }

    fn set_state(&self, state: EngineState) {
        self.control.write().expect("engine lock").state = state;
    }

    async fn initialize_session(&mut self) {
        self.set_state(EngineState::Observing);
        self.bus.send(CycleUpdate::StateChange {
            state: EngineState::Observing,
            message: "Initializing session...".to_string(),
        });

        if git::is_git_repo(&self.project.root) {
            let branch = format!("agent/{}", Local::now().format("%Y%m%d-%H%M%S"));
            let result = self
                .registry
                .execute(
                    "git_create_branch",
                    json!({"name": branch}),
                    self.master.child_token(),
                )
                .await;
            if let Ok(result) = result {
                debug!("agent branch: {}", result.output.trim());
            }
        }

        self.rebuild_system_prompt();
    }

    /// Rebuild the system message from prompt layers + working memory
    /// without disturbing later conversation entries.
    fn rebuild_system_prompt(&mut self) {
        let mut system = self.prompt.effective();
        let memory_text = self.memory.text();
        if !memory_text.is_empty() {
            system.push_str("\n\n");
            system.push_str(&memory_text);
        }

        let message = ChatMessage::text(Role::System, system);
        if self.messages.is_empty() {
            self.messages.push(message);
        } else {
            self.messages[0] = message;
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                EngineCommand::Checkpoint { message } => {
                    if let Err(e) = self.create_checkpoint(&message).await {
                        self.bus.send(CycleUpdate::Error {
                            message: format!("checkpoint failed: {e}"),
                        });
                    }
                }
                EngineCommand::Rollback => {
                    if let Err(e) = self.rollback().await {
                        self.bus.send(CycleUpdate::Error {
                            message: format!("rollback failed: {e}"),
                        });
                    }
                }
                EngineCommand::ForceCompact => self.run_compaction("forced"),
                EngineCommand::RefreshBacklog => self.refresh_backlog().await,
                EngineCommand::SetSessionInstructions(text) => {
                    self.prompt.set_session_instructions(text);
                    self.rebuild_system_prompt();
                }
                EngineCommand::ClearSessionInstructions => {
                    self.prompt.clear_session_instructions();
                    self.rebuild_system_prompt();
                }
                EngineCommand::ResetMemory => {
                    self.memory.reset();
                    self.rebuild_system_prompt();
                }
            }
        }
    }

    // =========================================================================
    // One cycle
    // =========================================================================

    async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<()> {
        let (goal, model) = {
            let control = self.control.read().expect("engine lock");
            (control.goal.clone(), self.client.model())
        };

        if goal.is_empty() {
            self.set_state(EngineState::Observing);
            self.bus.send(CycleUpdate::StateChange {
                state: EngineState::Observing,
                message: "Waiting for goal... Type your goal and press Enter".to_string(),
            });
            cancellable_sleep(WAITING_SLEEP, cancel).await?;
            return Ok(());
        }

        let Some(model) = model else {
            self.set_state(EngineState::Observing);
            self.bus.send(CycleUpdate::StateChange {
                state: EngineState::Observing,
                message: "No model selected! Use /model to pick one".to_string(),
            });
            cancellable_sleep(WAITING_SLEEP, cancel).await?;
            return Ok(());
        };

        // Phase 1: Observe
        self.set_state(EngineState::Observing);
        self.control.write().expect("engine lock").objective = goal.clone();
        self.bus.send(CycleUpdate::StateChange {
            state: EngineState::Observing,
            message: format!("Goal: {goal} | Model: {model}"),
        });

        let observation = self.observe(&goal, cancel).await;
        self.messages.push(ChatMessage::text(Role::User, observation));

        // Phase 2: Decide
        self.set_state(EngineState::Deciding);
        self.bus.send(CycleUpdate::StateChange {
            state: EngineState::Deciding,
            message: "Sending to model...".to_string(),
        });

        let (content, tool_calls) = self
            .decide(cancel)
            .await
            .map_err(|e| match e {
                BrewolError::Cancelled => BrewolError::Cancelled,
                other => BrewolError::cycle("decide", other.to_string()),
            })?;

        self.bus.send(CycleUpdate::Message {
            state: EngineState::Deciding,
            message: format!("Got response ({} chars)", content.len()),
        });

        let suggestions = backlog::parse_suggestions(&content);
        if !suggestions.is_empty() {
            self.bus.send(CycleUpdate::Suggestions { suggestions });
        }

        self.messages.push(ChatMessage {
            role: Role::Assistant,
            content: content.clone(),
            thinking: None,
            tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.clone()),
        });

        // Phase 3: Execute
        self.set_state(EngineState::Executing);
        self.execute(&content, &tool_calls, cancel).await;

        // Compaction trigger
        if self.budget.needs_compaction() {
            self.run_compaction("high watermark");
        }

        // Trim context
        self.trim_context();

        // Post-cycle bookkeeping
        let branch = git::current_branch(&self.project.root);
        self.memory.set_git_state(&branch, "");
        let cycle_count = self.control.read().expect("engine lock").cycle_count;
        self.memory.on_cycle_complete(cycle_count + 1);

        cancellable_sleep(INTER_CYCLE_SLEEP, cancel).await?;
        Ok(())
    }

    async fn observe(&self, goal: &str, cancel: &CancellationToken) -> String {
        let mut observation = format!("Goal: {goal}\n");

        if git::is_git_repo(&self.project.root) {
            if let Ok(status) = self
                .registry
                .execute("git_status", json!({}), cancel.clone())
                .await
            {
                if !status.output.is_empty() {
                    observation.push_str("\nGit status:\n");
                    observation.push_str(&status.output);
                }
            }
            let dirty = git::dirty_files(&self.project.root);
            if !dirty.is_empty() {
                observation.push_str(&format!("\nDirty files: {}\n", dirty.join(", ")));
            }
        }

        let cycle_count = self.control.read().expect("engine lock").cycle_count;
        if cycle_count == 0 {
            observation.push_str(
                "\nThis is the first cycle. Orient yourself: list the workspace, \
                 read the key files, and state your plan before changing anything.\n",
            );
        }

        observation
    }

    /// Stream the model's response, splitting thinking from content.
    async fn decide(&mut self, cancel: &CancellationToken) -> Result<(String, Vec<ToolCall>)> {
        let schemas = self.registry.to_model_schema();
        let started = Instant::now();

        let mut rx = self
            .client
            .chat_stream(&self.messages, Some(schemas), cancel.clone())
            .await?;

        let mut content = String::new();
        let mut thinking = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        while let Some(chunk) = rx.recv().await {
            if let Some(error) = chunk.error {
                return Err(error);
            }

            if chunk.is_thinking || chunk.thinking_content.is_some() {
                if let Some(fragment) = chunk.thinking_content {
                    thinking.push_str(&fragment);
                    self.bus.send(CycleUpdate::ThinkingContent { content: fragment });
                }
                continue;
            }

            let fragment = chunk.response.message.content.clone();
            if !fragment.is_empty() {
                content.push_str(&fragment);
                self.bus.send(CycleUpdate::TokenContent {
                    content: fragment,
                    tokens_per_sec: chunk.tokens_per_sec,
                });
            }

            if let Some(calls) = chunk.response.message.tool_calls.clone() {
                tool_calls.extend(calls);
            }

            if chunk.response.done {
                if let Some(metrics) = chunk.metrics {
                    self.budget
                        .update_metrics(metrics.prompt_eval_count, metrics.eval_count);
                    self.bus.send(CycleUpdate::TokensPerSec {
                        tokens_per_sec: metrics.tokens_per_sec,
                    });
                }
            }
        }

        let cycle_count = self.control.read().expect("engine lock").cycle_count;
        if !thinking.is_empty() {
            let _ = self
                .session
                .log_thinking(cycle_count, &thinking, started.elapsed().as_millis() as i64);
        }
        let _ = self.session.log_message("assistant", &content, None);
        let _ = self.memory.log_message("assistant", &content);

        Ok((content, tool_calls))
    }

    /// Dispatch the model's tool calls (or, in legacy mode, extracted
    /// shell commands) and feed the outputs back into the conversation.
    async fn execute(&mut self, content: &str, tool_calls: &[ToolCall], cancel: &CancellationToken) {
        let mut results_block = String::new();

        if self.config.legacy_command_extraction && tool_calls.is_empty() {
            for cmd in backlog::extract_commands(content) {
                self.bus.send(CycleUpdate::Message {
                    state: EngineState::Executing,
                    message: format!("Running: {cmd}"),
                });
                match self
                    .registry
                    .execute("shell", json!({"cmd": cmd}), cancel.clone())
                    .await
                {
                    Ok(result) => self.absorb_tool_result(&cmd, result, &mut results_block),
                    Err(e) => self.bus.send(CycleUpdate::Error {
                        message: e.to_string(),
                    }),
                }
            }
        } else if tool_calls.is_empty() {
            self.bus.send(CycleUpdate::Message {
                state: EngineState::Executing,
                message: "No tool calls in response".to_string(),
            });
        } else {
            for call in tool_calls {
                let name = &call.function.name;
                self.bus.send(CycleUpdate::Message {
                    state: EngineState::Executing,
                    message: format!("Executing: {name}"),
                });

                match self
                    .registry
                    .execute_with_qa(name, call.function.arguments.clone(), cancel.clone())
                    .await
                {
                    Ok(result) => {
                        let args = call.function.arguments.to_string();
                        let _ = self.session.log_tool_call(
                            name,
                            &args,
                            &result.output,
                            result.duration_seconds,
                            result.exit_code,
                            result.error.as_deref(),
                        );
                        let _ = self.memory.log_tool_call(
                            name,
                            &args,
                            &result.output,
                            result.exit_code,
                            result.duration_seconds,
                        );
                        self.absorb_tool_result(name, result, &mut results_block);
                    }
                    Err(e) => self.bus.send(CycleUpdate::Error {
                        message: e.to_string(),
                    }),
                }
            }
        }

        if !results_block.is_empty() {
            self.messages.push(ChatMessage::text(Role::User, results_block));
        }
    }

    fn absorb_tool_result(&self, label: &str, result: ToolResult, block: &mut String) {
        let compacted = self.compactor.compact_tool_output(&ToolOutput {
            name: result.name.clone(),
            command: label.to_string(),
            exit_code: result.exit_code,
            output: result.output.clone(),
            error: result.error.clone(),
            duration_seconds: result.duration_seconds,
            timestamp: chrono::Utc::now(),
        });
        block.push_str(&format!("[{}] {compacted}\n", result.name));
        self.bus.send(CycleUpdate::ToolResult { result });
    }

    /// Keep the conversation within `2 * max_turns + 1` messages.
    fn trim_context(&mut self) {
        let max_messages = 2 * self.budget.max_transcript_turns() + 1;
        if self.messages.len() <= max_messages {
            return;
        }
        let (compacted, summary) =
            self.compactor
                .compact_transcript(&self.messages, true, Some(&self.budget));
        self.messages = compacted;
        if !summary.is_empty() {
            debug!("trimmed context: {}", summary.lines().next().unwrap_or(""));
        }
    }

    /// Compact the transcript, fold a task brief into rolling memory,
    /// rebuild the system message, and record the event.
    fn run_compaction(&mut self, reason: &str) {
        let tokens_before = self.budget.state().last_prompt_tokens;

        let (compacted, summary) =
            self.compactor
                .compact_transcript(&self.messages, true, Some(&self.budget));
        self.messages = compacted;

        let objective = self.control.read().expect("engine lock").objective.clone();
        let brief = TaskBriefGenerator::new(&self.tasks).generate(
            BriefLevel::Compact,
            &objective,
            "",
        );
        let brief_line = brief.format_one_line();
        if !brief_line.is_empty() {
            self.memory.push_backlog_summary(brief_line);
        }

        let memory_block = self.compactor.build_rolling_memory(&RollingMemoryUpdate {
            git_branch: git::current_branch(&self.project.root),
            current_objective: objective,
            task_brief: brief.format_compact(),
            compaction_summary: summary.clone(),
            ..RollingMemoryUpdate::default()
        });
        debug!("rolling memory rebuilt ({} bytes)", memory_block.len());

        self.rebuild_system_prompt();

        let tokens_after: usize = self
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        self.budget.record_compaction(
            reason,
            tokens_before,
            tokens_after as u32,
            summary.lines().next().unwrap_or(""),
        );

        self.bus.send(CycleUpdate::Message {
            state: EngineState::Observing,
            message: format!("Context compacted ({reason})"),
        });
    }

    // =========================================================================
    // Checkpoint / recovery
    // =========================================================================

    async fn create_checkpoint(&mut self, message: &str) -> Result<()> {
        if !git::is_git_repo(&self.project.root) {
            return Ok(());
        }

        let (cycle_count, objective) = {
            let control = self.control.read().expect("engine lock");
            (control.cycle_count, control.objective.clone())
        };
        let message = if message.is_empty() {
            format!("Checkpoint at cycle {cycle_count}")
        } else {
            message.to_string()
        };

        self.set_state(EngineState::Committing);
        let commit_msg =
            format!("[brewol] {message}\n\nCycle: {cycle_count}\nObjective: {objective}");
        let result = self
            .registry
            .execute(
                "git_commit",
                json!({"message": commit_msg}),
                self.master.child_token(),
            )
            .await?;

        self.bus.send(CycleUpdate::StateChange {
            state: EngineState::Committing,
            message: format!("Checkpoint: {}", result.output.trim()),
        });

        let sha = git::head_commit(&self.project.root);
        self.memory.on_checkpoint(&sha);
        let _ = self.session.log_checkpoint(&sha, &message);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.set_state(EngineState::Recovering);
        self.bus.send(CycleUpdate::StateChange {
            state: EngineState::Recovering,
            message: "Rolling back to last checkpoint...".to_string(),
        });

        let result = self
            .registry
            .execute(
                "git_reset_hard",
                json!({"ref": "HEAD~1"}),
                self.master.child_token(),
            )
            .await?;

        self.bus.send(CycleUpdate::Message {
            state: EngineState::Recovering,
            message: format!("Rollback complete: {}", result.output.trim()),
        });
        Ok(())
    }

    /// After repeated failures, drop uncommitted changes unless the
    /// failure looks like an API problem (nothing local to roll back).
    async fn recover(&mut self) {
        self.set_state(EngineState::Recovering);
        self.bus.send(CycleUpdate::StateChange {
            state: EngineState::Recovering,
            message: "Attempting recovery...".to_string(),
        });

        let last_error = self.control.read().expect("engine lock").last_error.clone();
        let is_api_error = last_error.contains("API error")
            || last_error.contains("403")
            || last_error.contains("429")
            || last_error.contains("limit");

        if !is_api_error && git::is_git_repo(&self.project.root) {
            if !git::dirty_files(&self.project.root).is_empty() {
                self.bus.send(CycleUpdate::Message {
                    state: EngineState::Recovering,
                    message: "Rolling back uncommitted changes...".to_string(),
                });
                let _ = self
                    .registry
                    .execute(
                        "git_reset_hard",
                        json!({"ref": "HEAD"}),
                        self.master.child_token(),
                    )
                    .await;
            }
        }
    }

    /// Scan for TODOs and failing tests, feeding both into the backlog.
    async fn refresh_backlog(&mut self) {
        self.set_state(EngineState::Verifying);

        let issues = scan_for_todos(&self.project.root);
        {
            let mut control = self.control.write().expect("engine lock");
            for issue in issues {
                backlog::insert(
                    &mut control.backlog,
                    BacklogItem::new(
                        &issue.issue_type,
                        format!("{} in {}: {}", issue.issue_type, issue.file, issue.message),
                        issue.priority,
                        "scan",
                    ),
                );
            }
        }

        let test_result = self.verifier.run_tests().await;
        let mut control = self.control.write().expect("engine lock");
        control.last_verify_ok = test_result.success;
        if !test_result.success {
            for test in failing_tests(&test_result.output, self.project.project_type) {
                backlog::insert(
                    &mut control.backlog,
                    BacklogItem::new(
                        "failing-test",
                        format!("Fix failing test: {test}"),
                        1,
                        "test",
                    ),
                );
            }
        }
    }
}
