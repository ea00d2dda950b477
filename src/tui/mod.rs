//! Terminal UI runner.
//!
//! Owns the crossterm event loop: each iteration ticks the hub, redraws,
//! and waits up to one tick for keyboard input. [`TerminalGuard`] restores
//! the user's terminal however the loop exits.

pub mod input;
pub mod render;

pub use input::{key_to_pty_bytes, InputTranslator};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, DisableMouseCapture, Event};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, LeaveAlternateScreen};
use ratatui::backend::Backend;
use ratatui::Terminal;

use crate::constants::TICK;
use crate::hub::{dispatch, Hub, HubAction};

/// Restores the terminal on drop, including on panic unwind.
#[derive(Debug, Default)]
pub struct TerminalGuard;

impl TerminalGuard {
    /// Arm the guard.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(
            std::io::stdout(),
            LeaveAlternateScreen,
            DisableMouseCapture,
            crossterm::cursor::Show
        );
    }
}

/// Run the TUI event loop until quit or an external shutdown signal.
pub fn run_with_hub<B: Backend>(
    hub: &mut Hub,
    mut terminal: Terminal<B>,
    shutdown: &AtomicBool,
) -> Result<()>
where
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let mut translator = InputTranslator::new();

    // Agents spawn at the drawable size (screen minus the status line).
    let size = terminal.size()?;
    dispatch(
        hub,
        HubAction::Resize {
            rows: size.height.saturating_sub(1).max(1),
            cols: size.width,
        },
    );

    while !hub.quit && !shutdown.load(Ordering::Relaxed) {
        hub.tick();

        terminal.draw(|frame| render::draw(frame, hub))?;

        // Wait at most one tick for input so no source can stall the loop.
        if !event::poll(poll_timeout())? {
            continue;
        }

        match event::read()? {
            Event::Key(key) if key.kind != event::KeyEventKind::Release => {
                for action in translator.handle_key(&hub.state, key) {
                    dispatch(hub, action);
                }
            }
            Event::Resize(cols, rows) => {
                dispatch(
                    hub,
                    HubAction::Resize {
                        rows: rows.saturating_sub(1).max(1),
                        cols,
                    },
                );
            }
            Event::Paste(text) => {
                dispatch(hub, HubAction::Input(text.into_bytes()));
            }
            _ => {}
        }
    }

    Ok(())
}

fn poll_timeout() -> Duration {
    TICK
}
