//! Keyboard handling for the TUI.
//!
//! Normal mode forwards keystrokes to the selected agent's PTY, except the
//! `Ctrl-B` prefix: the key after it is a hub command (navigation, modals)
//! and neither byte reaches the agent. Modal modes get their own keymaps.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::hub::{ConfirmAction, HubAction, HubState, TuiMode};
use crate::terminal::ScrollOp;

/// Converts a key event to the byte sequence a PTY expects.
///
/// Arrows, function-row keys, and control characters all translate;
/// anything without a terminal encoding returns `None`.
#[must_use]
pub fn key_to_pty_bytes(code: KeyCode, modifiers: KeyModifiers) -> Option<Vec<u8>> {
    match code {
        KeyCode::Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A = 1, Ctrl+B = 2, ...
                let ctrl_code = (c.to_ascii_uppercase() as u8) - b'@';
                Some(vec![ctrl_code])
            } else {
                Some(c.to_string().into_bytes())
            }
        }
        KeyCode::Backspace => Some(vec![8]),
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Esc => Some(vec![27]),
        KeyCode::Left => Some(vec![27, 91, 68]),
        KeyCode::Right => Some(vec![27, 91, 67]),
        KeyCode::Up => Some(vec![27, 91, 65]),
        KeyCode::Down => Some(vec![27, 91, 66]),
        KeyCode::Home => Some(vec![27, 91, 72]),
        KeyCode::End => Some(vec![27, 91, 70]),
        KeyCode::PageUp => Some(vec![27, 91, 53, 126]),
        KeyCode::PageDown => Some(vec![27, 91, 54, 126]),
        KeyCode::Tab => Some(vec![9]),
        KeyCode::BackTab => Some(vec![27, 91, 90]),
        KeyCode::Delete => Some(vec![27, 91, 51, 126]),
        KeyCode::Insert => Some(vec![27, 91, 50, 126]),
        _ => None,
    }
}

/// Stateful key translator (tracks the `Ctrl-B` prefix).
#[derive(Debug, Default)]
pub struct InputTranslator {
    prefix_armed: bool,
}

impl InputTranslator {
    /// Fresh translator with no prefix armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one key event into hub actions given the current state.
    pub fn handle_key(&mut self, state: &HubState, event: KeyEvent) -> Vec<HubAction> {
        let KeyEvent {
            code, modifiers, ..
        } = event;

        match &state.mode {
            TuiMode::Normal => self.handle_normal(state, code, modifiers),
            TuiMode::Menu => handle_menu(state, code),
            TuiMode::WorktreePicker => handle_picker(state, code),
            TuiMode::Confirm(_) => handle_confirm(code),
            TuiMode::ConnectionCode => match code {
                KeyCode::Esc | KeyCode::Char('q') | KeyCode::Enter => {
                    vec![HubAction::CloseModal]
                }
                _ => Vec::new(),
            },
        }
    }

    fn handle_normal(
        &mut self,
        state: &HubState,
        code: KeyCode,
        modifiers: KeyModifiers,
    ) -> Vec<HubAction> {
        if self.prefix_armed {
            self.prefix_armed = false;
            return prefix_command(state, code);
        }

        if code == KeyCode::Char('b') && modifiers.contains(KeyModifiers::CONTROL) {
            self.prefix_armed = true;
            return Vec::new();
        }

        match (code, modifiers) {
            // Scrollback without leaving normal mode.
            (KeyCode::PageUp, m) if m.contains(KeyModifiers::SHIFT) => {
                vec![HubAction::Scroll(ScrollOp::Up(state.rows as usize / 2))]
            }
            (KeyCode::PageDown, m) if m.contains(KeyModifiers::SHIFT) => {
                vec![HubAction::Scroll(ScrollOp::Down(state.rows as usize / 2))]
            }
            (KeyCode::Home, m) if m.contains(KeyModifiers::SHIFT) => {
                vec![HubAction::Scroll(ScrollOp::Top)]
            }
            (KeyCode::End, m) if m.contains(KeyModifiers::SHIFT) => {
                vec![HubAction::Scroll(ScrollOp::Bottom)]
            }
            _ => match key_to_pty_bytes(code, modifiers) {
                Some(bytes) => vec![HubAction::Input(bytes)],
                None => Vec::new(),
            },
        }
    }
}

/// The command key following `Ctrl-B`.
fn prefix_command(state: &HubState, code: KeyCode) -> Vec<HubAction> {
    match code {
        KeyCode::Char('b') => {
            // Ctrl-B Ctrl-B / b sends a literal Ctrl-B to the agent.
            vec![HubAction::Input(vec![2])]
        }
        KeyCode::Char('m') => vec![HubAction::OpenModal(TuiMode::Menu)],
        KeyCode::Char('w') => vec![HubAction::OpenModal(TuiMode::WorktreePicker)],
        KeyCode::Char('c') => vec![HubAction::OpenModal(TuiMode::ConnectionCode)],
        KeyCode::Char('n') | KeyCode::Right => vec![HubAction::SelectNext],
        KeyCode::Char('p') | KeyCode::Left => vec![HubAction::SelectPrevious],
        KeyCode::Char('t') => vec![HubAction::ToggleView],
        KeyCode::Char('r') => vec![HubAction::TogglePolling],
        KeyCode::Char('d') => match state.selected_agent() {
            Some(agent) => vec![HubAction::OpenModal(TuiMode::Confirm(
                ConfirmAction::CloseAgent(agent.session_key.clone()),
            ))],
            None => Vec::new(),
        },
        KeyCode::Char('q') => vec![HubAction::OpenModal(TuiMode::Confirm(ConfirmAction::Quit))],
        KeyCode::Char(c) if c.is_ascii_digit() => {
            let index = c.to_digit(10).unwrap_or(0) as usize;
            vec![HubAction::SelectByIndex(index.saturating_sub(1))]
        }
        _ => Vec::new(),
    }
}

fn handle_menu(state: &HubState, code: KeyCode) -> Vec<HubAction> {
    match code {
        KeyCode::Esc | KeyCode::Char('q') => vec![HubAction::CloseModal],
        KeyCode::Up | KeyCode::Char('k') => vec![HubAction::SelectPrevious],
        KeyCode::Down | KeyCode::Char('j') => vec![HubAction::SelectNext],
        KeyCode::Enter => vec![HubAction::CloseModal],
        KeyCode::Char('d') => match state.selected_agent() {
            Some(agent) => vec![HubAction::OpenModal(TuiMode::Confirm(
                ConfirmAction::CloseAgent(agent.session_key.clone()),
            ))],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn handle_picker(state: &HubState, code: KeyCode) -> Vec<HubAction> {
    match code {
        KeyCode::Esc | KeyCode::Char('q') => vec![HubAction::CloseModal],
        KeyCode::Up | KeyCode::Char('k') => vec![HubAction::PickerUp],
        KeyCode::Down | KeyCode::Char('j') => vec![HubAction::PickerDown],
        KeyCode::Enter if !state.available_worktrees.is_empty() => {
            vec![HubAction::PickerSelect]
        }
        _ => Vec::new(),
    }
}

fn handle_confirm(code: KeyCode) -> Vec<HubAction> {
    match code {
        KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
            vec![HubAction::ConfirmAccepted]
        }
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => vec![HubAction::CloseModal],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    #[test]
    fn test_plain_keys_forward_to_pty() {
        let mut translator = InputTranslator::new();
        let state = HubState::new(24, 80);

        let actions = translator.handle_key(&state, key(KeyCode::Char('l')));
        assert!(matches!(&actions[..], [HubAction::Input(bytes)] if bytes == b"l"));

        let actions = translator.handle_key(&state, key(KeyCode::Enter));
        assert!(matches!(&actions[..], [HubAction::Input(bytes)] if bytes == b"\r"));
    }

    #[test]
    fn test_ctrl_b_prefix_is_not_forwarded() {
        let mut translator = InputTranslator::new();
        let state = HubState::new(24, 80);

        // The prefix itself produces nothing.
        let actions = translator.handle_key(&state, ctrl('b'));
        assert!(actions.is_empty());

        // The command key opens a modal, still nothing to the PTY.
        let actions = translator.handle_key(&state, key(KeyCode::Char('m')));
        assert!(matches!(&actions[..], [HubAction::OpenModal(TuiMode::Menu)]));

        // Prefix disarms after one command.
        let actions = translator.handle_key(&state, key(KeyCode::Char('m')));
        assert!(matches!(&actions[..], [HubAction::Input(bytes)] if bytes == b"m"));
    }

    #[test]
    fn test_double_ctrl_b_sends_literal() {
        let mut translator = InputTranslator::new();
        let state = HubState::new(24, 80);

        translator.handle_key(&state, ctrl('b'));
        let actions = translator.handle_key(&state, key(KeyCode::Char('b')));
        assert!(matches!(&actions[..], [HubAction::Input(bytes)] if bytes == &[2]));
    }

    #[test]
    fn test_ctrl_chars_encode() {
        assert_eq!(
            key_to_pty_bytes(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(vec![3])
        );
        assert_eq!(
            key_to_pty_bytes(KeyCode::Up, KeyModifiers::NONE),
            Some(vec![27, 91, 65])
        );
        assert_eq!(key_to_pty_bytes(KeyCode::F(5), KeyModifiers::NONE), None);
    }

    #[test]
    fn test_shift_page_scrolls() {
        let mut translator = InputTranslator::new();
        let state = HubState::new(24, 80);

        let actions =
            translator.handle_key(&state, KeyEvent::new(KeyCode::PageUp, KeyModifiers::SHIFT));
        assert!(matches!(&actions[..], [HubAction::Scroll(ScrollOp::Up(12))]));

        let actions =
            translator.handle_key(&state, KeyEvent::new(KeyCode::End, KeyModifiers::SHIFT));
        assert!(matches!(&actions[..], [HubAction::Scroll(ScrollOp::Bottom)]));
    }

    #[test]
    fn test_confirm_mode_keys() {
        let mut translator = InputTranslator::new();
        let mut state = HubState::new(24, 80);
        state.mode = TuiMode::Confirm(ConfirmAction::Quit);

        let actions = translator.handle_key(&state, key(KeyCode::Char('y')));
        assert!(matches!(&actions[..], [HubAction::ConfirmAccepted]));

        let actions = translator.handle_key(&state, key(KeyCode::Esc));
        assert!(matches!(&actions[..], [HubAction::CloseModal]));

        // Random keys do nothing in a confirm modal.
        let actions = translator.handle_key(&state, key(KeyCode::Char('x')));
        assert!(actions.is_empty());
    }
}
