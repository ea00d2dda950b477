//! Terminal screen model.
//!
//! Wraps a VT100 emulator with bounded scrollback and exposes the snapshot
//! operations the rest of the hub needs: cell matrices for the TUI, ANSI
//! repaints for browser resync, and a fast screen hash for change
//! suppression.
//!
//! # Submodules
//!
//! - [`notification`]: OSC 9 / OSC 777 notification detection

pub mod notification;

pub use notification::{detect_notifications, Notification};

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use vt100::Parser;

use crate::constants::SCROLLBACK_LINES;

/// Scroll operations forwarded from the TUI and browsers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrollOp {
    /// Scroll up (into history) by n lines.
    Up(usize),
    /// Scroll down (toward the live tail) by n lines.
    Down(usize),
    /// Jump to the oldest scrollback line.
    Top,
    /// Return to the live tail.
    Bottom,
}

/// One rendered screen cell with its SGR attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    /// Cell contents (may be empty, or multi-byte for wide glyphs).
    pub text: String,
    /// Foreground color.
    pub fg: vt100::Color,
    /// Background color.
    pub bg: vt100::Color,
    /// Bold attribute.
    pub bold: bool,
    /// Italic attribute.
    pub italic: bool,
    /// Underline attribute.
    pub underline: bool,
    /// Inverse-video attribute.
    pub inverse: bool,
}

/// VT100 screen plus bounded scrollback.
///
/// Malformed escape sequences are dropped silently by the underlying
/// emulator; `feed` never fails. The scrollback is a ring of rendered lines
/// maintained by the emulator, so resize re-flows stored lines rather than
/// replaying the whole input history.
pub struct TerminalParser {
    parser: Parser,
}

impl std::fmt::Debug for TerminalParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, cols) = self.parser.screen().size();
        f.debug_struct("TerminalParser")
            .field("rows", &rows)
            .field("cols", &cols)
            .field("scroll_offset", &self.scroll_offset())
            .finish()
    }
}

impl TerminalParser {
    /// Create a parser with the given screen size and default scrollback.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        let (rows, cols) = clamp_size(rows, cols);
        Self {
            parser: Parser::new(rows, cols, SCROLLBACK_LINES),
        }
    }

    /// Parse raw PTY bytes, updating the screen and scrollback.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    /// Resize the screen. Dimensions are clamped to a 1×1 minimum.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        let (rows, cols) = clamp_size(rows, cols);
        self.parser.screen_mut().set_size(rows, cols);
    }

    /// Current screen dimensions as (rows, cols).
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    /// Number of lines currently available in scrollback.
    ///
    /// The emulator only exposes the current offset directly, so this probes
    /// the clamp: setting an oversized offset clamps to the history length.
    #[must_use]
    pub fn scrollback_len(&mut self) -> usize {
        let saved = self.parser.screen().scrollback();
        self.parser.screen_mut().set_scrollback(usize::MAX);
        let len = self.parser.screen().scrollback();
        self.parser.screen_mut().set_scrollback(saved);
        len
    }

    /// Set the scroll offset: 0 is the live tail, n > 0 is lines back from
    /// the tail. Clamped to `[0, scrollback_len]` by the emulator.
    pub fn set_scroll_offset(&mut self, n: usize) {
        self.parser.screen_mut().set_scrollback(n);
    }

    /// Current scroll offset (0 = live tail).
    #[must_use]
    pub fn scroll_offset(&self) -> usize {
        self.parser.screen().scrollback()
    }

    /// Apply a scroll operation relative to the current offset.
    pub fn scroll(&mut self, op: ScrollOp) {
        let current = self.scroll_offset();
        match op {
            ScrollOp::Up(n) => self.set_scroll_offset(current.saturating_add(n)),
            ScrollOp::Down(n) => self.set_scroll_offset(current.saturating_sub(n)),
            ScrollOp::Top => self.set_scroll_offset(usize::MAX),
            ScrollOp::Bottom => self.set_scroll_offset(0),
        }
    }

    /// Current visible screen (respecting the scroll offset) as a cell
    /// matrix with SGR attributes.
    #[must_use]
    pub fn cells(&self) -> Vec<Vec<Cell>> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut out = Vec::with_capacity(rows as usize);

        for row in 0..rows {
            let mut line = Vec::with_capacity(cols as usize);
            for col in 0..cols {
                if let Some(cell) = screen.cell(row, col) {
                    line.push(Cell {
                        text: cell.contents().to_string(),
                        fg: cell.fgcolor(),
                        bg: cell.bgcolor(),
                        bold: cell.bold(),
                        italic: cell.italic(),
                        underline: cell.underline(),
                        inverse: cell.inverse(),
                    });
                } else {
                    line.push(Cell {
                        text: String::new(),
                        fg: vt100::Color::Default,
                        bg: vt100::Color::Default,
                        bold: false,
                        italic: false,
                        underline: false,
                        inverse: false,
                    });
                }
            }
            out.push(line);
        }

        out
    }

    /// Cursor position as (row, col).
    #[must_use]
    pub fn cursor_position(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Stable 64-bit hash of the visible screen, used to suppress redundant
    /// broadcasts. Non-cryptographic.
    #[must_use]
    pub fn screen_hash(&self) -> u64 {
        let screen = self.parser.screen();
        let mut hasher = DefaultHasher::new();
        screen.contents().hash(&mut hasher);
        screen.cursor_position().hash(&mut hasher);
        screen.scrollback().hash(&mut hasher);
        hasher.finish()
    }

    /// Full-screen repaint as ANSI escape sequences.
    ///
    /// Used when a browser reconnects past the replay buffer: the snapshot
    /// restores the visible screen without replaying raw history.
    #[must_use]
    pub fn snapshot_ansi(&self) -> String {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();

        let mut output = String::new();

        // Hide cursor during the repaint to prevent flicker, then reset
        // attributes, clear screen and scrollback, move home.
        output.push_str("\x1b[?25l");
        output.push_str("\x1b[0m\x1b[2J\x1b[3J\x1b[H");

        for row in 0..rows {
            let _ = write!(output, "\x1b[{};1H", row + 1);

            let mut last_fg = vt100::Color::Default;
            let mut last_bg = vt100::Color::Default;
            let mut last_bold = false;
            let mut last_italic = false;
            let mut last_underline = false;
            let mut last_inverse = false;

            for col in 0..cols {
                let Some(cell) = screen.cell(row, col) else {
                    continue;
                };
                let contents = cell.contents();
                if contents.is_empty() {
                    continue;
                }

                let _ = write!(output, "\x1b[{};{}H", row + 1, col + 1);

                let fg = cell.fgcolor();
                let bg = cell.bgcolor();
                let bold = cell.bold();
                let italic = cell.italic();
                let underline = cell.underline();
                let inverse = cell.inverse();

                let attrs_changed = fg != last_fg
                    || bg != last_bg
                    || bold != last_bold
                    || italic != last_italic
                    || underline != last_underline
                    || inverse != last_inverse;

                if attrs_changed {
                    output.push_str("\x1b[0m");
                    write_color(&mut output, fg, true);
                    write_color(&mut output, bg, false);
                    if bold {
                        output.push_str("\x1b[1m");
                    }
                    if italic {
                        output.push_str("\x1b[3m");
                    }
                    if underline {
                        output.push_str("\x1b[4m");
                    }
                    if inverse {
                        output.push_str("\x1b[7m");
                    }

                    last_fg = fg;
                    last_bg = bg;
                    last_bold = bold;
                    last_italic = italic;
                    last_underline = underline;
                    last_inverse = inverse;
                }

                output.push_str(&contents);
            }
        }

        output.push_str("\x1b[0m");

        let cursor = screen.cursor_position();
        let _ = write!(output, "\x1b[{};{}H", cursor.0 + 1, cursor.1 + 1);
        output.push_str("\x1b[?25h");

        output
    }

    /// Visible screen rows as plain strings (attributes stripped).
    #[must_use]
    pub fn rows_text(&self) -> Vec<String> {
        let screen = self.parser.screen();
        screen.rows(0, screen.size().1).collect()
    }
}

/// Emit an SGR color sequence for a fore- or background color.
fn write_color(output: &mut String, color: vt100::Color, foreground: bool) {
    let base = if foreground { 38 } else { 48 };
    match color {
        vt100::Color::Default => {}
        vt100::Color::Idx(i) => {
            let _ = write!(output, "\x1b[{};5;{}m", base, i);
        }
        vt100::Color::Rgb(r, g, b) => {
            let _ = write!(output, "\x1b[{};2;{};{};{}m", base, r, g, b);
        }
    }
}

fn clamp_size(rows: u16, cols: u16) -> (u16, u16) {
    (rows.max(1), cols.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_renders_text() {
        let mut parser = TerminalParser::new(4, 20);
        parser.feed(b"hello");
        let rows = parser.rows_text();
        assert!(rows[0].starts_with("hello"));
    }

    #[test]
    fn test_malformed_sequences_are_dropped() {
        let mut parser = TerminalParser::new(4, 20);
        // Truncated CSI followed by text must not panic or corrupt state.
        parser.feed(b"\x1b[99;99;99");
        parser.feed(b"ok");
        assert_eq!(parser.size(), (4, 20));
    }

    #[test]
    fn test_resize_clamps_to_one_by_one() {
        let mut parser = TerminalParser::new(24, 80);
        parser.resize(0, 0);
        assert_eq!(parser.size(), (1, 1));
    }

    #[test]
    fn test_scroll_offset_clamps_to_history() {
        let mut parser = TerminalParser::new(2, 10);
        for i in 0..20 {
            parser.feed(format!("line {}\r\n", i).as_bytes());
        }
        let len = parser.scrollback_len();
        assert!(len > 0);

        parser.set_scroll_offset(usize::MAX);
        assert_eq!(parser.scroll_offset(), len);

        parser.scroll(ScrollOp::Bottom);
        assert_eq!(parser.scroll_offset(), 0);

        parser.scroll(ScrollOp::Down(5));
        assert_eq!(parser.scroll_offset(), 0);
    }

    #[test]
    fn test_screen_hash_changes_with_content() {
        let mut parser = TerminalParser::new(4, 20);
        let before = parser.screen_hash();
        parser.feed(b"output");
        let after = parser.screen_hash();
        assert_ne!(before, after);

        // Feeding nothing leaves the hash stable.
        parser.feed(b"");
        assert_eq!(parser.screen_hash(), after);
    }

    #[test]
    fn test_cells_dimensions_match_size() {
        let mut parser = TerminalParser::new(3, 7);
        parser.feed(b"ab");
        let cells = parser.cells();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].len(), 7);
        assert_eq!(cells[0][0].text, "a");
        assert_eq!(cells[0][1].text, "b");
    }

    #[test]
    fn test_snapshot_ansi_contains_screen_text() {
        let mut parser = TerminalParser::new(4, 20);
        parser.feed(b"\x1b[1mbold\x1b[0m plain");
        let snapshot = parser.snapshot_ansi();
        assert!(snapshot.contains("bold"));
        assert!(snapshot.contains("plain"));
        // Repaint starts from a cleared screen.
        assert!(snapshot.contains("\x1b[2J"));
    }
}
