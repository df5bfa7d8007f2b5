//! Key hints for the current mode.

use crate::tui::app::Mode;
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Widget,
};

pub struct Footer {
    mode: Mode,
    busy: bool,
}

impl Footer {
    pub fn new(mode: Mode, busy: bool) -> Self {
        Self { mode, busy }
    }

    fn hints(&self) -> &'static [(&'static str, &'static str)] {
        match self.mode {
            Mode::Review => &[("Enter", "approve"), ("Esc", "cancel")],
            Mode::Export => &[("p", "preview"), ("a", "all"), ("Esc", "close")],
            Mode::Settings => &[("Enter", "save"), ("Tab", "next field"), ("Esc", "cancel")],
            Mode::Editing if self.busy => &[("Esc", "cancel"), ("^Q", "quit")],
            Mode::Editing => &[
                ("^E", "estimate"),
                ("^R", "review"),
                ("^G", "run"),
                ("^S", "export"),
                ("^T", "refresh metadata"),
                ("^L", "log/preview"),
                ("^O", "settings"),
                ("^Q", "quit"),
            ],
        }
    }
}

impl Widget for Footer {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let key = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
        let mut spans = Vec::new();
        for (k, label) in self.hints() {
            spans.push(Span::styled(format!(" {k}"), key));
            spans.push(Span::raw(format!(" {label} ")));
        }
        buf.set_line(area.x, area.y, &Line::from(spans), area.width);
    }
}
