//! Operator log tab.

use crate::tui::app::{LogEntry, LogLevel};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Style},
    text::{Line, Span},
    widgets::Widget,
};

pub struct LogPanel<'a> {
    entries: &'a [LogEntry],
}

impl<'a> LogPanel<'a> {
    pub fn new(entries: &'a [LogEntry]) -> Self {
        Self { entries }
    }
}

impl Widget for LogPanel<'_> {
    /// Newest entries at the bottom; older ones scroll off the top.
    fn render(self, area: Rect, buf: &mut Buffer) {
        let height = area.height as usize;
        let skip = self.entries.len().saturating_sub(height);
        for (i, entry) in self.entries.iter().skip(skip).enumerate() {
            let style = match entry.level {
                LogLevel::Info => Style::default(),
                LogLevel::Warn => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
            };
            let line = Line::from(vec![
                Span::styled(
                    entry.at.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(entry.message.clone(), style),
            ]);
            buf.set_line(area.x, area.y + i as u16, &line, area.width);
        }
    }
}
