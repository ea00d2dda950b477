//! Hub state: the ordered agent table and TUI surface state.
//!
//! The orchestrator is the sole writer. Agents live in an ordered map so
//! TUI navigation and browser indices stay stable; the selection cursor,
//! modal mode, and status-line error all live here so rendering is a pure
//! function of this struct.

use std::collections::BTreeMap;

use crate::agent::Agent;
use crate::relay::AgentSummary;
use crate::server::SessionKey;

/// Modal state of the TUI surface.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum TuiMode {
    /// Keystrokes forward to the selected agent's active PTY.
    #[default]
    Normal,
    /// Agent list navigation.
    Menu,
    /// Pick an existing worktree for a manual spawn.
    WorktreePicker,
    /// Yes/no confirmation for a destructive action.
    Confirm(ConfirmAction),
    /// Show the browser pairing URL/QR.
    ConnectionCode,
}

/// What a confirmation modal will do on "yes".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmAction {
    /// Close the agent and delete its worktree.
    CloseAgent(SessionKey),
    /// Quit the hub.
    Quit,
}

/// The orchestrator's aggregate state.
pub struct HubState {
    /// Live agents, ordered by session key for stable indices.
    agents: BTreeMap<SessionKey, Agent>,
    /// Index of the selected agent (clamped into range on removal).
    pub selected: usize,
    /// Current TUI mode.
    pub mode: TuiMode,
    /// Cursor inside the menu modal.
    pub menu_cursor: usize,
    /// Cursor inside the worktree picker.
    pub picker_cursor: usize,
    /// Worktrees available for manual spawn.
    pub available_worktrees: Vec<(std::path::PathBuf, String)>,
    /// Whether server polling is enabled.
    pub polling_enabled: bool,
    /// Most recent user-visible error, shown in the status line.
    pub last_error: Option<String>,
    /// Current terminal size agents are spawned at.
    pub rows: u16,
    /// Current terminal size agents are spawned at.
    pub cols: u16,
}

impl std::fmt::Debug for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubState")
            .field("agents", &self.agents.len())
            .field("selected", &self.selected)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl HubState {
    /// Empty state at the given terminal size.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            agents: BTreeMap::new(),
            selected: 0,
            mode: TuiMode::Normal,
            menu_cursor: 0,
            picker_cursor: 0,
            available_worktrees: Vec::new(),
            polling_enabled: true,
            last_error: None,
            rows,
            cols,
        }
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// True when a live agent holds this key (spawn idempotency).
    #[must_use]
    pub fn has_agent(&self, key: &SessionKey) -> bool {
        self.agents.contains_key(key)
    }

    /// Insert an agent under its session key.
    pub fn insert_agent(&mut self, agent: Agent) {
        self.agents.insert(agent.session_key.clone(), agent);
    }

    /// Remove an agent, clamping the selection cursor.
    pub fn remove_agent(&mut self, key: &SessionKey) -> Option<Agent> {
        let removed = self.agents.remove(key);
        if self.selected >= self.agents.len() {
            self.selected = self.agents.len().saturating_sub(1);
        }
        removed
    }

    /// Borrow an agent by key.
    #[must_use]
    pub fn agent(&self, key: &SessionKey) -> Option<&Agent> {
        self.agents.get(key)
    }

    /// Mutably borrow an agent by key.
    pub fn agent_mut(&mut self, key: &SessionKey) -> Option<&mut Agent> {
        self.agents.get_mut(key)
    }

    /// Session keys in display order.
    #[must_use]
    pub fn keys(&self) -> Vec<SessionKey> {
        self.agents.keys().cloned().collect()
    }

    /// Iterate agents in display order.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Mutably iterate agents in display order.
    pub fn agents_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.agents.values_mut()
    }

    /// The selected agent, if any.
    #[must_use]
    pub fn selected_agent(&self) -> Option<&Agent> {
        self.agents.values().nth(self.selected)
    }

    /// Mutably borrow the selected agent.
    pub fn selected_agent_mut(&mut self) -> Option<&mut Agent> {
        self.agents.values_mut().nth(self.selected)
    }

    /// Move the selection cursor forward (wraps).
    pub fn select_next(&mut self) {
        if !self.agents.is_empty() {
            self.selected = (self.selected + 1) % self.agents.len();
        }
    }

    /// Move the selection cursor back (wraps).
    pub fn select_previous(&mut self) {
        if !self.agents.is_empty() {
            self.selected = self
                .selected
                .checked_sub(1)
                .unwrap_or(self.agents.len() - 1);
        }
    }

    /// Jump the cursor to an index (clamped).
    pub fn select_by_index(&mut self, index: usize) {
        if !self.agents.is_empty() {
            self.selected = index.min(self.agents.len() - 1);
        }
    }

    /// Agent table snapshot for browsers and Lua.
    #[must_use]
    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents
            .values()
            .map(|agent| AgentSummary {
                session_key: agent.session_key.to_string(),
                repo: agent.repo.clone(),
                issue_number: agent.issue_number,
                branch_name: agent.branch_name.clone(),
                status: agent.status().to_string(),
                has_server: agent.has_server(),
            })
            .collect()
    }
}
