//! TUI rendering.
//!
//! Rendering is a pure function of hub state: the selected agent's screen,
//! a status line, and whichever modal is open. Cell attributes from the
//! VT100 parser map directly onto ratatui styles.

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, Paragraph};
use ratatui::Frame;

use crate::hub::{ConfirmAction, Hub, TuiMode};
use crate::terminal::Cell as TermCell;

/// Draw one frame.
pub fn draw(frame: &mut Frame, hub: &Hub) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(1)])
        .split(frame.area());

    draw_agent_screen(frame, hub, chunks[0]);
    draw_status_line(frame, hub, chunks[1]);

    match &hub.state.mode {
        TuiMode::Normal => {}
        TuiMode::Menu => draw_menu(frame, hub),
        TuiMode::WorktreePicker => draw_picker(frame, hub),
        TuiMode::Confirm(action) => draw_confirm(frame, action),
        TuiMode::ConnectionCode => draw_connection_code(frame, hub),
    }
}

fn draw_agent_screen(frame: &mut Frame, hub: &Hub, area: Rect) {
    let Some(agent) = hub.state.selected_agent() else {
        let empty = Paragraph::new(Text::from(vec![
            Line::from(""),
            Line::from("  No agents running."),
            Line::from(""),
            Line::from("  Ctrl-B w  spawn from a worktree"),
            Line::from("  Ctrl-B c  show browser connection code"),
            Line::from("  Ctrl-B q  quit"),
        ]))
        .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(empty, area);
        return;
    };

    let view = agent.active_view;
    let cells = agent.snapshot_cells(view);
    let mut lines = Vec::with_capacity(cells.len());

    for row in cells.iter().take(area.height as usize) {
        let mut spans = Vec::new();
        let mut run = String::new();
        let mut run_style = Style::default();

        for cell in row.iter().take(area.width as usize) {
            let style = cell_style(cell);
            if style != run_style && !run.is_empty() {
                spans.push(Span::styled(std::mem::take(&mut run), run_style));
            }
            run_style = style;
            if cell.text.is_empty() {
                run.push(' ');
            } else {
                run.push_str(&cell.text);
            }
        }
        if !run.is_empty() {
            spans.push(Span::styled(run, run_style));
        }
        lines.push(Line::from(spans));
    }

    frame.render_widget(Paragraph::new(Text::from(lines)), area);
}

fn cell_style(cell: &TermCell) -> Style {
    let mut style = Style::default()
        .fg(vt_color(cell.fg, Color::Reset))
        .bg(vt_color(cell.bg, Color::Reset));
    if cell.bold {
        style = style.add_modifier(Modifier::BOLD);
    }
    if cell.italic {
        style = style.add_modifier(Modifier::ITALIC);
    }
    if cell.underline {
        style = style.add_modifier(Modifier::UNDERLINED);
    }
    if cell.inverse {
        style = style.add_modifier(Modifier::REVERSED);
    }
    style
}

fn vt_color(color: vt100::Color, default: Color) -> Color {
    match color {
        vt100::Color::Default => default,
        vt100::Color::Idx(i) => Color::Indexed(i),
        vt100::Color::Rgb(r, g, b) => Color::Rgb(r, g, b),
    }
}

fn draw_status_line(frame: &mut Frame, hub: &Hub, area: Rect) {
    let agent_part = match hub.state.selected_agent() {
        Some(agent) => format!(
            " {} [{}/{}] {} ({})",
            agent.session_key,
            hub.state.selected + 1,
            hub.state.agent_count(),
            agent.status(),
            agent.active_view,
        ),
        None => " no agents".to_string(),
    };

    let polling = if hub.state.polling_enabled {
        "polling"
    } else {
        "paused"
    };

    let mut spans = vec![
        Span::styled(agent_part, Style::default().fg(Color::Cyan)),
        Span::raw("  "),
        Span::styled(polling, Style::default().fg(Color::DarkGray)),
    ];

    if let Some(error) = &hub.state.last_error {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            error.clone(),
            Style::default().fg(Color::Red),
        ));
    }

    spans.push(Span::raw("  Ctrl-B ? for commands"));

    let status = Paragraph::new(Line::from(spans))
        .style(Style::default().bg(Color::Black).fg(Color::Gray));
    frame.render_widget(status, area);
}

fn draw_menu(frame: &mut Frame, hub: &Hub) {
    let area = centered_rect(60, 50, frame.area());
    frame.render_widget(Clear, area);

    let items: Vec<ListItem> = hub
        .state
        .agents()
        .enumerate()
        .map(|(i, agent)| {
            let marker = if i == hub.state.selected { "> " } else { "  " };
            let label = format!(
                "{marker}{} - {} ({})",
                agent.session_key,
                agent.branch_name,
                agent.status()
            );
            let style = if i == hub.state.selected {
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(label).style(style)
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Agents (Enter select, d close, Esc back) "),
    );
    frame.render_widget(list, area);
}

fn draw_picker(frame: &mut Frame, hub: &Hub) {
    let area = centered_rect(70, 50, frame.area());
    frame.render_widget(Clear, area);

    let items: Vec<ListItem> = if hub.state.available_worktrees.is_empty() {
        vec![ListItem::new("  (no spare worktrees)")]
    } else {
        hub.state
            .available_worktrees
            .iter()
            .enumerate()
            .map(|(i, (path, branch))| {
                let marker = if i == hub.state.picker_cursor { "> " } else { "  " };
                let style = if i == hub.state.picker_cursor {
                    Style::default().fg(Color::Yellow)
                } else {
                    Style::default()
                };
                ListItem::new(format!("{marker}{branch} - {}", path.display())).style(style)
            })
            .collect()
    };

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Spawn agent on worktree (Enter spawn, Esc back) "),
    );
    frame.render_widget(list, area);
}

fn draw_confirm(frame: &mut Frame, action: &ConfirmAction) {
    let area = centered_rect(50, 20, frame.area());
    frame.render_widget(Clear, area);

    let question = match action {
        ConfirmAction::CloseAgent(key) => {
            format!("Close agent {key} and delete its worktree?")
        }
        ConfirmAction::Quit => "Quit the hub and stop all agents?".to_string(),
    };

    let body = Paragraph::new(Text::from(vec![
        Line::from(""),
        Line::from(format!("  {question}")),
        Line::from(""),
        Line::from("  [y] yes    [n] no"),
    ]))
    .block(Block::default().borders(Borders::ALL).title(" Confirm "));
    frame.render_widget(body, area);
}

fn draw_connection_code(frame: &mut Frame, hub: &Hub) {
    let area = centered_rect(80, 30, frame.area());
    frame.render_widget(Clear, area);

    // The bundle id rides in the URL fragment; the server never sees it.
    let url = hub.connection_url();
    let body = Paragraph::new(Text::from(vec![
        Line::from(""),
        Line::from("  Open this URL in your browser to connect:"),
        Line::from(""),
        Line::from(Span::styled(
            format!("  {url}"),
            Style::default().fg(Color::Green),
        )),
        Line::from(""),
        Line::from("  Esc to close"),
    ]))
    .block(Block::default().borders(Borders::ALL).title(" Connect a browser "));
    frame.render_widget(body, area);
}

/// A centered sub-rectangle sized as a percentage of `area`.
fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_rect_is_inside() {
        let outer = Rect::new(0, 0, 100, 40);
        let inner = centered_rect(60, 50, outer);
        assert!(inner.width <= 60);
        assert!(inner.height <= 20);
        assert!(inner.x >= 20);
        assert!(inner.y >= 10);
    }

    #[test]
    fn test_vt_color_mapping() {
        assert_eq!(vt_color(vt100::Color::Default, Color::Reset), Color::Reset);
        assert_eq!(vt_color(vt100::Color::Idx(5), Color::Reset), Color::Indexed(5));
        assert_eq!(
            vt_color(vt100::Color::Rgb(1, 2, 3), Color::Reset),
            Color::Rgb(1, 2, 3)
        );
    }
}
