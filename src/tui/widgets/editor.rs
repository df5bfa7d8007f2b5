//! Query editor pane.

use crate::tui::app::cursor;
use ratatui::{
    layout::{Position, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

/// Width of the line-number gutter, including the trailing space.
const GUTTER: u16 = 4;

pub struct Editor<'a> {
    text: &'a str,
    cursor: usize,
    revision: u64,
    focused: bool,
}

impl<'a> Editor<'a> {
    pub fn new(text: &'a str, cursor: usize, revision: u64, focused: bool) -> Self {
        Self {
            text,
            cursor,
            revision,
            focused,
        }
    }

    /// First visible line so that the cursor line stays on screen.
    fn scroll(&self, height: usize) -> usize {
        let (line, _) = cursor::line_col(self.text, self.cursor);
        line.saturating_sub(height.saturating_sub(1))
    }

    pub fn render(self, frame: &mut Frame, area: Rect) {
        let border = if self.focused {
            Color::Cyan
        } else {
            Color::DarkGray
        };
        let block = Block::default()
            .title(format!(" Query (rev {}) ", self.revision))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border));
        let inner = block.inner(area);
        let scroll = self.scroll(inner.height as usize);

        let lines: Vec<Line> = self
            .text
            .split('\n')
            .enumerate()
            .skip(scroll)
            .take(inner.height as usize)
            .map(|(i, line)| {
                Line::from(vec![
                    Span::styled(
                        format!("{:>3} ", i + 1),
                        Style::default().fg(Color::DarkGray),
                    ),
                    Span::raw(line.to_string()),
                ])
            })
            .collect();

        frame.render_widget(Paragraph::new(lines).block(block), area);

        if self.focused {
            let (line, col) = cursor::line_col(self.text, self.cursor);
            let x = inner.x + GUTTER + col as u16;
            let y = inner.y + (line - scroll) as u16;
            if x < inner.right() && y < inner.bottom() {
                frame.set_cursor_position(Position::new(x, y));
            }
        }
    }
}
