//! Export dialog.

use ratatui::{
    layout::Alignment,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

use super::review::center_rect;

pub fn render_export_dialog(frame: &mut Frame, preview_rows: usize, can_export_all: bool) {
    let key = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let mut lines = vec![Line::from(vec![
        Span::styled("[p]", key),
        Span::raw(format!(" preview ({preview_rows} rows)")),
    ])];
    if can_export_all {
        lines.push(Line::from(vec![
            Span::styled("[a]", key),
            Span::raw(" all rows"),
        ]));
    } else {
        lines.push(Line::from(Span::styled(
            "[a] all rows (already exported; run again)",
            Style::default().fg(Color::DarkGray),
        )));
    }
    lines.push(Line::from(vec![
        Span::styled("[Esc]", key),
        Span::raw(" close"),
    ]));

    let area = center_rect(48, lines.len() as u16 + 2, frame.area());
    frame.render_widget(Clear, area);
    let block = Block::default()
        .title("Export CSV")
        .title_alignment(Alignment::Center)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .style(Style::default().bg(Color::Black));
    frame.render_widget(Paragraph::new(lines).block(block), area);
}
