//! Settings dialog.

use ratatui::{
    layout::{Alignment, Position},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

use super::review::center_rect;
use crate::guard::human_bytes;
use crate::tui::app::{SettingsForm, SETTINGS_LABELS};

const LABEL_WIDTH: usize = 18;

pub fn render_settings_dialog(frame: &mut Frame, form: &SettingsForm) {
    let key = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let mut lines = Vec::new();
    for (i, (label, value)) in SETTINGS_LABELS.iter().zip(&form.fields).enumerate() {
        let focused = i == form.focus;
        let label_style = if focused {
            key
        } else {
            Style::default().fg(Color::Gray)
        };
        let mut spans = vec![
            Span::styled(format!("{label:<LABEL_WIDTH$}"), label_style),
            Span::styled(value.clone(), Style::default().add_modifier(Modifier::BOLD)),
        ];
        if let Some(hint) = field_hint(i, value) {
            spans.push(Span::styled(
                format!("  {hint}"),
                Style::default().fg(Color::DarkGray),
            ));
        }
        lines.push(Line::from(spans));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(vec![
        Span::styled("[Enter]", key),
        Span::raw(" save  "),
        Span::styled("[Tab]", key),
        Span::raw(" next  "),
        Span::styled("[Esc]", key),
        Span::raw(" cancel"),
    ]));

    let area = center_rect(64, lines.len() as u16 + 2, frame.area());
    frame.render_widget(Clear, area);
    let block = Block::default()
        .title("Settings")
        .title_alignment(Alignment::Center)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .style(Style::default().bg(Color::Black));
    let inner = block.inner(area);
    frame.render_widget(Paragraph::new(lines).block(block), area);

    let x = inner.x + (LABEL_WIDTH + form.fields[form.focus].chars().count()) as u16;
    let y = inner.y + form.focus as u16;
    if x < inner.right() && y < inner.bottom() {
        frame.set_cursor_position(Position::new(x, y));
    }
}

/// Byte limits read back in human units; blank location explained.
fn field_hint(index: usize, value: &str) -> Option<String> {
    match index {
        0 | 1 => value.trim().parse().ok().map(human_bytes),
        3 if value.trim().is_empty() => Some("(unset)".to_string()),
        _ => None,
    }
}
