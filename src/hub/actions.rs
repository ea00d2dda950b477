//! Hub actions: the closed set of commands that mutate hub state.
//!
//! Keyboard input, browser frames, server messages, and Lua requests all
//! reduce to a [`HubAction`] before touching state, so every mutation
//! funnels through [`dispatch`] on the orchestrator task.

use crate::hub::state::{ConfirmAction, TuiMode};
use crate::hub::Hub;
use crate::relay::View;
use crate::server::{SessionKey, WorkItem};
use crate::terminal::ScrollOp;

/// Every way hub state can change.
#[derive(Debug, Clone)]
pub enum HubAction {
    // === Agent lifecycle ===
    /// Spawn an agent for a polled work item (idempotent by session key).
    SpawnAgent(Box<WorkItem>),
    /// Close an agent and tear down its worktree.
    CloseAgent {
        /// Target agent.
        session_key: SessionKey,
    },
    /// A worker observed a failure that ends an agent.
    AgentFailed {
        /// Target agent.
        session_key: SessionKey,
        /// Human-readable reason for the status line and notification.
        reason: String,
    },

    // === Selection & view ===
    /// Select the next agent.
    SelectNext,
    /// Select the previous agent.
    SelectPrevious,
    /// Select an agent by index.
    SelectByIndex(usize),
    /// Toggle between main and server views of the selected agent.
    ToggleView,

    // === Terminal interaction ===
    /// Scroll the selected agent's active view.
    Scroll(ScrollOp),
    /// The local terminal was resized.
    Resize {
        /// New rows.
        rows: u16,
        /// New cols.
        cols: u16,
    },
    /// Keyboard bytes for the selected agent's active PTY.
    Input(Vec<u8>),
    /// Browser input for a specific agent and view.
    BrowserInput {
        /// Target agent.
        session_key: SessionKey,
        /// Which PTY.
        view: View,
        /// Raw bytes.
        bytes: Vec<u8>,
    },

    // === TUI surface ===
    /// Open a modal.
    OpenModal(TuiMode),
    /// Return to normal mode.
    CloseModal,
    /// A confirmation modal was answered "yes".
    ConfirmAccepted,
    /// Move the worktree-picker cursor up.
    PickerUp,
    /// Move the worktree-picker cursor down.
    PickerDown,
    /// Spawn an agent on the worktree under the picker cursor.
    PickerSelect,

    // === Application control ===
    /// Pause or resume server polling.
    TogglePolling,
    /// Request shutdown.
    Quit,
}

/// Apply one action to the hub. The single entry point for mutations.
pub fn dispatch(hub: &mut Hub, action: HubAction) {
    match action {
        HubAction::SpawnAgent(item) => {
            hub.spawn_from_item(&item);
        }

        HubAction::CloseAgent { session_key } => {
            hub.close_agent(&session_key);
        }

        HubAction::AgentFailed {
            session_key,
            reason,
        } => {
            hub.fail_agent(&session_key, &reason);
        }

        HubAction::SelectNext => hub.state.select_next(),
        HubAction::SelectPrevious => hub.state.select_previous(),
        HubAction::SelectByIndex(index) => hub.state.select_by_index(index),

        HubAction::ToggleView => {
            if let Some(agent) = hub.state.selected_agent_mut() {
                agent.toggle_view();
            }
        }

        HubAction::Scroll(op) => {
            if let Some(agent) = hub.state.selected_agent_mut() {
                let view = agent.active_view;
                agent.scroll(view, op);
            }
        }

        HubAction::Resize { rows, cols } => {
            hub.state.rows = rows;
            hub.state.cols = cols;
            for agent in hub.state.agents_mut() {
                agent.resize(rows, cols);
            }
        }

        HubAction::Input(bytes) => {
            if let Some(agent) = hub.state.selected_agent_mut() {
                let view = agent.active_view;
                if let Err(e) = agent.write_input(view, &bytes) {
                    log::warn!("input to {} failed: {e}", agent.session_key);
                }
            }
        }

        HubAction::BrowserInput {
            session_key,
            view,
            bytes,
        } => {
            if let Some(agent) = hub.state.agent_mut(&session_key) {
                if let Err(e) = agent.write_input(view, &bytes) {
                    log::warn!("browser input to {session_key} failed: {e}");
                }
            }
        }

        HubAction::OpenModal(mode) => {
            if matches!(mode, TuiMode::WorktreePicker) {
                hub.refresh_available_worktrees();
            }
            hub.state.mode = mode;
        }

        HubAction::CloseModal => {
            hub.state.mode = TuiMode::Normal;
        }

        HubAction::ConfirmAccepted => {
            let TuiMode::Confirm(confirm) = hub.state.mode.clone() else {
                return;
            };
            hub.state.mode = TuiMode::Normal;
            match confirm {
                ConfirmAction::CloseAgent(session_key) => hub.close_agent(&session_key),
                ConfirmAction::Quit => hub.quit = true,
            }
        }

        HubAction::PickerUp => {
            hub.state.picker_cursor = hub.state.picker_cursor.saturating_sub(1);
        }

        HubAction::PickerDown => {
            let max = hub.state.available_worktrees.len().saturating_sub(1);
            hub.state.picker_cursor = (hub.state.picker_cursor + 1).min(max);
        }

        HubAction::PickerSelect => {
            let picked = hub
                .state
                .available_worktrees
                .get(hub.state.picker_cursor)
                .cloned();
            hub.state.mode = TuiMode::Normal;
            if let Some((_, branch)) = picked {
                hub.spawn_on_branch(&branch);
            }
        }

        HubAction::TogglePolling => {
            hub.state.polling_enabled = !hub.state.polling_enabled;
            hub.set_polling(hub.state.polling_enabled);
        }

        HubAction::Quit => {
            hub.quit = true;
        }
    }
}
