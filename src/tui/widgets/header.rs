//! Header bar: app name, project, location and the busy indicator.

use super::spinner::Spinner;
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::Span,
    widgets::Widget,
};

pub struct Header<'a> {
    project: Option<&'a str>,
    location: &'a str,
    spinner: Option<&'a Spinner>,
}

impl<'a> Header<'a> {
    pub fn new(project: Option<&'a str>, location: &'a str, spinner: Option<&'a Spinner>) -> Self {
        Self {
            project,
            location,
            spinner,
        }
    }
}

impl Widget for Header<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let style = Style::default()
            .bg(Color::Blue)
            .fg(Color::White)
            .add_modifier(Modifier::BOLD);

        for x in area.left()..area.right() {
            buf[(x, area.y)].set_style(style);
        }

        let left_text = format!(" bq-guard v{}", env!("CARGO_PKG_VERSION"));
        buf.set_span(area.x, area.y, &Span::styled(left_text, style), area.width);

        if let Some(spinner) = self.spinner {
            let text = spinner.display();
            let spinner_style = style.fg(Color::Yellow);
            let width = text.chars().count() as u16;
            let x = area.x + area.width.saturating_sub(width) / 2;
            buf.set_string(x, area.y, &text, spinner_style);
        }

        let right_text = format!(
            " [project: {}] [location: {}] ",
            self.project.unwrap_or("(none)"),
            self.location
        );
        let right_width = right_text.chars().count() as u16;
        if right_width < area.width {
            let x = area.right().saturating_sub(right_width);
            buf.set_string(x, area.y, &right_text, style);
        }
    }
}
