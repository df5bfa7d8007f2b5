//! Preview grid for the last execution.
//!
//! Renders rows with column headers, auto-sized columns and styled NULLs.

use crate::guard::ResultPreview;
use crate::warehouse::{Row, Value};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Widget,
};

/// Maximum width for any column.
const MAX_COLUMN_WIDTH: usize = 40;

/// Minimum width for any column.
const MIN_COLUMN_WIDTH: usize = 4;

pub struct ResultTable<'a> {
    preview: &'a ResultPreview,
    /// First row shown.
    offset: usize,
}

impl<'a> ResultTable<'a> {
    pub fn new(preview: &'a ResultPreview) -> Self {
        Self { preview, offset: 0 }
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn calculate_column_widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self
            .preview
            .columns
            .iter()
            .map(|col| col.name.chars().count().max(MIN_COLUMN_WIDTH))
            .collect();

        for row in &self.preview.rows {
            for (i, value) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(i) {
                    *width = (*width).max(value.to_display_string().chars().count());
                }
            }
        }

        widths.iter().map(|&w| w.min(MAX_COLUMN_WIDTH)).collect()
    }

    /// Truncates to `max_width` chars, with an ellipsis when there is room.
    fn truncate(s: &str, max_width: usize) -> String {
        if s.chars().count() <= max_width {
            s.to_string()
        } else if max_width <= 3 {
            s.chars().take(max_width).collect()
        } else {
            let head: String = s.chars().take(max_width - 3).collect();
            format!("{head}...")
        }
    }

    /// Lines for the header, the rows from `offset` on, and a summary footer.
    pub fn render_to_lines(&self, available_width: usize, max_rows: usize) -> Vec<Line<'a>> {
        let mut lines = Vec::new();

        if self.preview.columns.is_empty() {
            lines.push(Line::from(Span::styled(
                "(no columns)",
                Style::default().fg(Color::DarkGray),
            )));
            return lines;
        }

        let widths = self.calculate_column_widths();
        let total_width: usize = widths.iter().sum::<usize>() + widths.len() * 3 + 1;
        let scale = if total_width > available_width && available_width > 0 {
            available_width as f64 / total_width as f64
        } else {
            1.0
        };
        let widths: Vec<usize> = widths
            .iter()
            .map(|&w| ((w as f64 * scale) as usize).max(MIN_COLUMN_WIDTH))
            .collect();

        lines.push(self.render_header_row(&widths));
        lines.push(Self::render_separator(&widths));
        for row in self.preview.rows.iter().skip(self.offset).take(max_rows) {
            lines.push(Self::render_data_row(row, &widths));
        }
        lines.push(Line::from(Span::styled(
            self.footer(),
            Style::default().fg(Color::DarkGray),
        )));

        lines
    }

    fn footer(&self) -> String {
        let shown = self.preview.rows.len();
        let total = match (self.preview.complete, self.preview.job.total_rows) {
            (true, _) => format!("{shown} row{}", if shown == 1 { "" } else { "s" }),
            (false, Some(total)) => format!("first {shown} of {total} rows"),
            (false, None) => format!("first {shown} rows"),
        };
        format!("{total} | job {}", self.preview.job.job_id)
    }

    fn render_separator(widths: &[usize]) -> Line<'a> {
        let parts: Vec<String> = widths.iter().map(|&w| "─".repeat(w + 2)).collect();
        Line::from(Span::styled(
            parts.join("┼"),
            Style::default().fg(Color::DarkGray),
        ))
    }

    fn render_header_row(&self, widths: &[usize]) -> Line<'a> {
        let mut spans = Vec::new();
        for (i, col) in self.preview.columns.iter().enumerate() {
            let width = widths.get(i).copied().unwrap_or(MIN_COLUMN_WIDTH);
            if i > 0 {
                spans.push(Span::styled("│", Style::default().fg(Color::DarkGray)));
            }
            spans.push(Span::styled(
                format!(" {:width$} ", Self::truncate(&col.name, width)),
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ));
        }
        Line::from(spans)
    }

    fn render_data_row(row: &Row, widths: &[usize]) -> Line<'a> {
        let mut spans = Vec::new();
        for (i, value) in row.iter().enumerate() {
            let width = widths.get(i).copied().unwrap_or(MIN_COLUMN_WIDTH);
            if i > 0 {
                spans.push(Span::styled("│", Style::default().fg(Color::DarkGray)));
            }
            let text = Self::truncate(&value.to_display_string(), width);
            let style = if matches!(value, Value::Null) {
                Style::default()
                    .fg(Color::DarkGray)
                    .add_modifier(Modifier::ITALIC)
            } else {
                Style::default()
            };
            spans.push(Span::styled(format!(" {text:width$} "), style));
        }
        Line::from(spans)
    }
}

impl Widget for ResultTable<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        // Header, separator and footer take three lines.
        let max_rows = (area.height as usize).saturating_sub(3);
        let lines = self.render_to_lines(area.width as usize, max_rows);
        for (i, line) in lines.iter().take(area.height as usize).enumerate() {
            buf.set_line(area.x, area.y + i as u16, line, area.width);
        }
    }
}
