//! Review dialog.
//!
//! Shows the estimate under review and takes the typed confirmation phrase.
//! Border colour follows the worst finding: red when approval is blocked,
//! yellow with warnings, green otherwise.

use ratatui::{
    layout::{Alignment, Constraint, Flex, Layout, Position, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame,
};

use super::estimate::finding_line;
use crate::guard::Estimate;

/// SQL lines shown before eliding the rest.
const MAX_SQL_LINES: usize = 5;

pub fn render_review_dialog(
    frame: &mut Frame,
    estimate: &Estimate,
    blocking: &[String],
    typed: &str,
) {
    let area = frame.area();
    let dialog_width = (area.width as f32 * 0.7).clamp(40.0, 90.0) as u16;
    let content_width = dialog_width.saturating_sub(4) as usize;
    let sql_lines = wrap_sql(&estimate.sql, content_width);

    let (border_color, title) = if !blocking.is_empty() {
        (Color::Red, "Review: approval blocked")
    } else if estimate.review.has_warnings() {
        (Color::Yellow, "Review: warnings")
    } else {
        (Color::Green, "Review")
    };

    let mut lines = Vec::new();
    for sql_line in sql_lines.iter().take(MAX_SQL_LINES) {
        lines.push(Line::from(Span::styled(
            format!("  {sql_line}"),
            Style::default().fg(Color::Cyan),
        )));
    }
    if sql_lines.len() > MAX_SQL_LINES {
        lines.push(Line::from(Span::styled(
            "  ...",
            Style::default().fg(Color::DarkGray),
        )));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(format!(
        "Scans {} | fingerprint {}",
        estimate.bytes_human(),
        estimate.fingerprint.short()
    )));
    for finding in &estimate.review.findings {
        lines.push(finding_line(finding));
    }
    lines.push(Line::from(""));

    let phrase = estimate.confirmation_phrase();
    if blocking.is_empty() {
        lines.push(Line::from(vec![
            Span::raw("Type "),
            Span::styled(
                phrase.clone(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            Span::raw(" and press Enter to approve, Esc to cancel"),
        ]));
    } else {
        lines.push(Line::from(Span::styled(
            format!("Blocked by: {}. Esc to close", blocking.join(", ")),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
    }
    let prompt = format!("> {typed}");
    lines.push(Line::from(Span::styled(
        prompt.clone(),
        Style::default().add_modifier(Modifier::BOLD),
    )));

    let dialog_height = (lines.len() as u16 + 2).min(area.height);
    let dialog_area = center_rect(dialog_width, dialog_height, area);
    frame.render_widget(Clear, dialog_area);

    let block = Block::default()
        .title(title)
        .title_alignment(Alignment::Center)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .style(Style::default().bg(Color::Black));
    let inner = block.inner(dialog_area);
    frame.render_widget(
        Paragraph::new(lines).block(block).wrap(Wrap { trim: false }),
        dialog_area,
    );

    // The prompt is the last line of the dialog.
    let x = inner.x + prompt.chars().count() as u16;
    let y = inner.bottom().saturating_sub(1);
    if x < inner.right() {
        frame.set_cursor_position(Position::new(x, y));
    }
}

/// Wraps SQL text to fit within the given width.
fn wrap_sql(sql: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let sql = sql.trim();

    for line in sql.lines() {
        if line.chars().count() <= max_width {
            lines.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split_whitespace() {
            if current.is_empty() {
                current = word.to_string();
            } else if current.chars().count() + 1 + word.chars().count() <= max_width {
                current.push(' ');
                current.push_str(word);
            } else {
                lines.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }

    if lines.is_empty() {
        lines.push(sql.to_string());
    }
    lines
}

/// Centers a rectangle of the given size within the parent area.
pub fn center_rect(width: u16, height: u16, area: Rect) -> Rect {
    let horizontal = Layout::horizontal([Constraint::Length(width)]).flex(Flex::Center);
    let vertical = Layout::vertical([Constraint::Length(height)]).flex(Flex::Center);

    let [area] = vertical.areas(area);
    let [area] = horizontal.areas(area);
    area
}
