//! Agent management.
//!
//! An [`Agent`] owns everything for one work item: an isolated git
//! worktree, a main PTY running the user's init script, and optionally a
//! second PTY running a dev server behind the tunnel. The hub drives the
//! lifecycle; agents never remove themselves.
//!
//! ```text
//! Initializing ──spawn ok──▶ Running ──exit 0──▶ Completed
//!      │                        │ ─exit≠0──▶ Failed
//!      └─spawn err──▶ Failed    │ ─kill──▶  Killed
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use thiserror::Error;

use crate::constants::SPAWN_GRACE;
use crate::pty::{PtyError, PtySession};
use crate::relay::View;
use crate::server::{NotificationKind, SessionKey};
use crate::terminal::{Notification, ScrollOp};
use crate::worktree::{WorktreeError, WorktreeManager};

/// Agent lifecycle status. Transitions only move forward; terminal states
/// cause the hub to remove the agent in the same tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentStatus {
    /// Worktree created, waiting for the PTY's first output.
    Initializing,
    /// The agent process is live.
    Running,
    /// Main process exited 0.
    Completed,
    /// Spawn failed or the main process exited non-zero.
    Failed(String),
    /// Stopped by a close action.
    Killed,
}

impl AgentStatus {
    /// True for states the hub removes the agent in.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Killed)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Why an agent is being stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Work finished normally.
    Completed,
    /// Close action from a user or the server.
    Killed,
    /// Something broke.
    Failed(String),
}

/// Errors from agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Worktree creation or teardown failed.
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    /// PTY spawn or write failed.
    #[error(transparent)]
    Pty(#[from] PtyError),
    /// Prompt file or other filesystem failure.
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to start one agent.
#[derive(Clone, Debug)]
pub struct SpawnConfig {
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Path of the local checkout worktrees are created from.
    pub repo_path: PathBuf,
    /// Issue number, when issue-based.
    pub issue_number: Option<u32>,
    /// Branch to check out.
    pub branch_name: String,
    /// Prompt text handed to the agent via a file.
    pub prompt: String,
    /// Originating URL for linkback.
    pub invocation_url: Option<String>,
    /// The user's agent init command.
    pub init_command: String,
    /// Optional dev-server init command.
    pub server_command: Option<String>,
    /// Initial terminal size.
    pub rows: u16,
    /// Initial terminal size.
    pub cols: u16,
}

/// One managed agent: worktree + PTYs + lifecycle state.
///
/// Exclusively owned by the hub; all access is serialized through it.
pub struct Agent {
    /// Process-lifetime unique id.
    pub id: uuid::Uuid,
    /// Deterministic session key.
    pub session_key: SessionKey,
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Issue number, when issue-based.
    pub issue_number: Option<u32>,
    /// Checked-out branch.
    pub branch_name: String,
    /// Worktree location on disk.
    pub worktree_path: PathBuf,
    /// Creation time.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Last observed activity (output or input).
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
    /// Lifecycle status.
    status: AgentStatus,
    /// Which PTY the TUI shows.
    pub active_view: View,
    /// Allocated tunnel port, unique across live agents.
    pub tunnel_port: Option<u16>,
    /// Originating URL for linkback.
    pub last_invocation_url: Option<String>,

    main_pty: Option<PtySession>,
    server_pty: Option<PtySession>,

    notification_tx: Sender<Notification>,
    notification_rx: Receiver<Notification>,
    spawned_at: Instant,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("session_key", &self.session_key)
            .field("status", &self.status)
            .field("worktree_path", &self.worktree_path)
            .field("tunnel_port", &self.tunnel_port)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create the record for a work item. No side effects until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(
        session_key: SessionKey,
        repo: String,
        issue_number: Option<u32>,
        branch_name: String,
    ) -> Self {
        let (notification_tx, notification_rx) = mpsc::channel();
        Self {
            id: uuid::Uuid::new_v4(),
            session_key,
            repo,
            issue_number,
            branch_name,
            worktree_path: PathBuf::new(),
            started_at: chrono::Utc::now(),
            last_activity_at: chrono::Utc::now(),
            status: AgentStatus::Initializing,
            active_view: View::Main,
            tunnel_port: None,
            last_invocation_url: None,
            main_pty: None,
            server_pty: None,
            notification_tx,
            notification_rx,
            spawned_at: Instant::now(),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> &AgentStatus {
        &self.status
    }

    /// Forward-only status update; terminal states are never left.
    fn set_status(&mut self, status: AgentStatus) {
        if self.status.is_terminal() {
            return;
        }
        log::info!("agent {} -> {}", self.session_key, status);
        self.status = status;
    }

    /// Create the worktree and spawn the main PTY.
    ///
    /// The prompt lands in a file (`.botster/prompt`) rather than on the
    /// command line, and the init command runs with the `BOTSTER_*`
    /// environment set. On failure the agent transitions to `Failed` and
    /// the error is surfaced.
    pub fn start(
        &mut self,
        worktrees: &WorktreeManager,
        cfg: &SpawnConfig,
    ) -> Result<(), AgentError> {
        let dest = worktrees
            .base_dir()
            .join(self.session_key.as_str());

        let worktree_path = match worktrees.create(&cfg.repo_path, &cfg.branch_name, &dest) {
            Ok(path) => path,
            Err(e) => {
                self.set_status(AgentStatus::Failed(e.to_string()));
                return Err(e.into());
            }
        };
        self.worktree_path = worktree_path;
        self.last_invocation_url = cfg.invocation_url.clone();

        let prompt_file = self.worktree_path.join(".botster").join("prompt");
        if let Some(parent) = prompt_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&prompt_file, &cfg.prompt)?;

        let mut env = HashMap::new();
        env.insert("BOTSTER_REPO".to_string(), self.repo.clone());
        env.insert(
            "BOTSTER_ISSUE_NUMBER".to_string(),
            self.issue_number.map(|n| n.to_string()).unwrap_or_default(),
        );
        env.insert("BOTSTER_BRANCH_NAME".to_string(), self.branch_name.clone());
        env.insert(
            "BOTSTER_WORKTREE_PATH".to_string(),
            self.worktree_path.to_string_lossy().to_string(),
        );
        env.insert(
            "BOTSTER_PROMPT_FILE".to_string(),
            prompt_file.to_string_lossy().to_string(),
        );

        let spawned = PtySession::spawn(
            &cfg.init_command,
            &self.worktree_path,
            &env,
            cfg.rows,
            cfg.cols,
            self.notification_tx.clone(),
        );

        match spawned {
            Ok(pty) => {
                self.main_pty = Some(pty);
                self.spawned_at = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.set_status(AgentStatus::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Spawn the dev-server PTY with `BOTSTER_TUNNEL_PORT` bound.
    pub fn start_server(
        &mut self,
        server_command: &str,
        port: u16,
        rows: u16,
        cols: u16,
    ) -> Result<(), AgentError> {
        let mut env = HashMap::new();
        env.insert("BOTSTER_TUNNEL_PORT".to_string(), port.to_string());
        env.insert("BOTSTER_REPO".to_string(), self.repo.clone());
        env.insert("BOTSTER_BRANCH_NAME".to_string(), self.branch_name.clone());
        env.insert(
            "BOTSTER_WORKTREE_PATH".to_string(),
            self.worktree_path.to_string_lossy().to_string(),
        );

        let pty = PtySession::spawn(
            server_command,
            &self.worktree_path,
            &env,
            rows,
            cols,
            self.notification_tx.clone(),
        )?;
        self.server_pty = Some(pty);
        self.tunnel_port = Some(port);
        Ok(())
    }

    /// Drive time-based transitions; returns the new status when it
    /// changed this tick.
    ///
    /// `Initializing → Running` after first output or the 5 s grace.
    /// `Running → Completed/Failed` when the main process exits.
    pub fn tick_status(&mut self) -> Option<AgentStatus> {
        let before = self.status.clone();

        match self.status {
            AgentStatus::Initializing => {
                let saw_output = self.main_pty.as_ref().is_some_and(PtySession::saw_output);
                if saw_output || self.spawned_at.elapsed() >= SPAWN_GRACE {
                    self.set_status(AgentStatus::Running);
                }
                if saw_output {
                    self.last_activity_at = chrono::Utc::now();
                }
            }
            AgentStatus::Running => {
                if let Some(pty) = self.main_pty.as_mut() {
                    if let Some(code) = pty.try_exit_code() {
                        if code == 0 {
                            self.set_status(AgentStatus::Completed);
                        } else {
                            self.set_status(AgentStatus::Failed(format!(
                                "exited with code {code}"
                            )));
                        }
                    }
                }
            }
            _ => {}
        }

        (self.status != before).then(|| self.status.clone())
    }

    /// Write input bytes to the named PTY.
    pub fn write_input(&mut self, view: View, bytes: &[u8]) -> Result<(), AgentError> {
        self.last_activity_at = chrono::Utc::now();
        match self.pty_mut(view) {
            Some(pty) => match pty.write(bytes) {
                // A closed PTY eats input without failing the hub.
                Ok(()) | Err(PtyError::Closed) => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        }
    }

    /// Forward a scroll operation to the named PTY's terminal.
    pub fn scroll(&mut self, view: View, op: ScrollOp) {
        if let Some(pty) = self.pty(view) {
            pty.parser().lock().unwrap().scroll(op);
        }
    }

    /// Resize both PTYs (and their parsers).
    pub fn resize(&self, rows: u16, cols: u16) {
        if let Some(pty) = &self.main_pty {
            pty.resize(rows, cols);
        }
        if let Some(pty) = &self.server_pty {
            pty.resize(rows, cols);
        }
    }

    /// Current screen hash for the named view.
    #[must_use]
    pub fn screen_hash(&self, view: View) -> u64 {
        self.pty(view)
            .map(|p| p.parser().lock().unwrap().screen_hash())
            .unwrap_or(0)
    }

    /// Full-screen ANSI snapshot for the named view (browser resync, new
    /// subscribers).
    #[must_use]
    pub fn snapshot_ansi(&self, view: View) -> String {
        self.pty(view)
            .map(|p| p.parser().lock().unwrap().snapshot_ansi())
            .unwrap_or_default()
    }

    /// Cell-matrix snapshot for the TUI.
    #[must_use]
    pub fn snapshot_cells(&self, view: View) -> Vec<Vec<crate::terminal::Cell>> {
        self.pty(view)
            .map(|p| p.parser().lock().unwrap().cells())
            .unwrap_or_default()
    }

    /// Shared parser handle for the named view (TUI rendering).
    #[must_use]
    pub fn parser(&self, view: View) -> Option<std::sync::Arc<std::sync::Mutex<crate::terminal::TerminalParser>>> {
        self.pty(view).map(PtySession::parser)
    }

    /// Drain raw output bytes for the named view.
    #[must_use]
    pub fn drain_raw(&self, view: View) -> Vec<u8> {
        self.pty(view).map(PtySession::drain_raw).unwrap_or_default()
    }

    /// Whether a dev-server PTY exists.
    #[must_use]
    pub fn has_server(&self) -> bool {
        self.server_pty.is_some()
    }

    /// Flip between main and server views (no-op without a server PTY).
    pub fn toggle_view(&mut self) {
        self.active_view = match self.active_view {
            View::Main => {
                if self.server_pty.is_some() {
                    View::Server
                } else {
                    View::Main
                }
            }
            View::Server => View::Main,
        };
    }

    /// Drain notifications detected since the last poll.
    #[must_use]
    pub fn poll_notifications(&self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Ok(n) = self.notification_rx.try_recv() {
            notifications.push(n);
        }
        notifications
    }

    /// Stop the agent: TERM/KILL both PTYs, tear the worktree down, enter
    /// the terminal state for `reason`.
    pub fn stop(&mut self, worktrees: &WorktreeManager, repo_path: &std::path::Path, reason: StopReason) {
        if let Some(mut pty) = self.main_pty.take() {
            pty.close();
        }
        if let Some(mut pty) = self.server_pty.take() {
            pty.close();
        }

        if !self.worktree_path.as_os_str().is_empty() {
            if let Err(e) = worktrees.destroy(repo_path, &self.worktree_path, &self.branch_name) {
                log::warn!(
                    "worktree teardown for {} failed: {}",
                    self.session_key,
                    e
                );
            }
        }

        self.set_status(match reason {
            StopReason::Completed => AgentStatus::Completed,
            StopReason::Killed => AgentStatus::Killed,
            StopReason::Failed(msg) => AgentStatus::Failed(msg),
        });
    }

    fn pty(&self, view: View) -> Option<&PtySession> {
        match view {
            View::Main => self.main_pty.as_ref(),
            // Input meant for a missing server PTY falls through to main,
            // matching what the TUI shows in that case.
            View::Server => self.server_pty.as_ref().or(self.main_pty.as_ref()),
        }
    }

    fn pty_mut(&mut self, view: View) -> Option<&mut PtySession> {
        match view {
            View::Main => self.main_pty.as_mut(),
            View::Server => self.server_pty.as_mut().or(self.main_pty.as_mut()),
        }
    }
}

/// Classify a detected OSC notification into a server-facing kind.
///
/// OSC 777 titles matching any of `question_patterns` (case-insensitive
/// substring) count as "the agent asked a question"; everything else is
/// passed through.
#[must_use]
pub fn classify_notification(
    notification: &Notification,
    question_patterns: &[String],
) -> NotificationKind {
    match notification {
        Notification::Osc9(message) => NotificationKind::Osc9(message.clone()),
        Notification::Osc777 { title, body } => {
            let haystack = title.to_lowercase();
            if question_patterns
                .iter()
                .any(|p| haystack.contains(&p.to_lowercase()))
            {
                NotificationKind::QuestionAsked
            } else {
                NotificationKind::Osc777 {
                    title: title.clone(),
                    body: body.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new(
            SessionKey::for_issue("acme/demo", 42),
            "acme/demo".into(),
            Some(42),
            "issue-42".into(),
        )
    }

    #[test]
    fn test_new_agent_is_initializing() {
        let a = agent();
        assert_eq!(*a.status(), AgentStatus::Initializing);
        assert_eq!(a.active_view, View::Main);
        assert_eq!(a.session_key.as_str(), "acme-demo-42");
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut a = agent();
        a.set_status(AgentStatus::Running);
        a.set_status(AgentStatus::Killed);
        // Terminal states never change again.
        a.set_status(AgentStatus::Running);
        assert_eq!(*a.status(), AgentStatus::Killed);
        a.set_status(AgentStatus::Completed);
        assert_eq!(*a.status(), AgentStatus::Killed);
    }

    #[test]
    fn test_toggle_view_without_server_stays_main() {
        let mut a = agent();
        a.toggle_view();
        assert_eq!(a.active_view, View::Main);
    }

    #[test]
    fn test_classify_question_notification() {
        let patterns = vec!["question".to_string(), "waiting".to_string()];

        let n = Notification::Osc777 {
            title: "Question".into(),
            body: "Continue?".into(),
        };
        assert_eq!(
            classify_notification(&n, &patterns),
            NotificationKind::QuestionAsked
        );

        let n = Notification::Osc777 {
            title: "Waiting for input".into(),
            body: String::new(),
        };
        assert_eq!(
            classify_notification(&n, &patterns),
            NotificationKind::QuestionAsked
        );

        let n = Notification::Osc777 {
            title: "Build done".into(),
            body: "All green".into(),
        };
        assert_eq!(
            classify_notification(&n, &patterns),
            NotificationKind::Osc777 {
                title: "Build done".into(),
                body: "All green".into()
            }
        );

        let n = Notification::Osc9("finished".into());
        assert_eq!(
            classify_notification(&n, &patterns),
            NotificationKind::Osc9("finished".into())
        );
    }

    #[test]
    fn test_screen_ops_without_pty_are_safe() {
        let mut a = agent();
        assert_eq!(a.screen_hash(View::Main), 0);
        assert!(a.snapshot_ansi(View::Main).is_empty());
        assert!(a.snapshot_cells(View::Server).is_empty());
        assert!(a.drain_raw(View::Main).is_empty());
        assert!(a.write_input(View::Main, b"ignored").is_ok());
        a.scroll(View::Main, ScrollOp::Up(5));
    }
}
