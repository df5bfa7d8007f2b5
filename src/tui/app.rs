//! Interactive UI state.
//!
//! Everything the guarded workflow decides lives in the session; this holds
//! only what the screen needs on top of it: cursor, open dialog, log lines.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Local};

use super::widgets::spinner::Spinner;
use crate::config::Config;
use crate::error::{GuardError, Result};

/// Log lines kept for the log tab.
const MAX_LOG_ENTRIES: usize = 500;

/// Which surface receives key presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Editing,
    /// The review dialog is open and takes the typed confirmation phrase.
    Review,
    /// The export dialog is open.
    Export,
    /// The settings dialog is open.
    Settings,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Editing => "Editing",
            Mode::Review => "Review",
            Mode::Export => "Export",
            Mode::Settings => "Settings",
        };
        write!(f, "{s}")
    }
}

/// Bottom pane tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Preview,
    Log,
}

impl Tab {
    pub fn toggle(self) -> Self {
        match self {
            Tab::Preview => Tab::Log,
            Tab::Log => Tab::Preview,
        }
    }
}

/// Field labels of the settings dialog, in focus order.
pub const SETTINGS_LABELS: [&str; 4] = [
    "Warn bytes",
    "Block bytes",
    "Preview rows",
    "Default location",
];

/// Settings being edited, held as text until saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsForm {
    pub fields: [String; 4],
    pub focus: usize,
}

impl SettingsForm {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fields: [
                config.limits.warn_bytes.to_string(),
                config.limits.block_bytes.to_string(),
                config.app.preview_rows.to_string(),
                config.app.default_location.clone().unwrap_or_default(),
            ],
            focus: 0,
        }
    }

    pub fn focused_mut(&mut self) -> &mut String {
        &mut self.fields[self.focus]
    }

    pub fn focus_next(&mut self) {
        self.focus = (self.focus + 1) % self.fields.len();
    }

    pub fn focus_prev(&mut self) {
        self.focus = (self.focus + self.fields.len() - 1) % self.fields.len();
    }

    /// Location typed into the form, if any.
    pub fn location(&self) -> Option<&str> {
        Some(self.fields[3].trim()).filter(|l| !l.is_empty())
    }

    /// Copies `base` with the edited fields parsed onto it. Not yet validated.
    pub fn apply_to(&self, base: &Config) -> Result<Config> {
        let mut config = base.clone();
        config.limits.warn_bytes = self.number(0)?;
        config.limits.block_bytes = self.number(1)?;
        config.app.preview_rows = self.number(2)?;
        config.app.default_location = self.location().map(String::from);
        Ok(config)
    }

    fn number<T: std::str::FromStr>(&self, index: usize) -> Result<T> {
        self.fields[index].trim().parse().map_err(|_| {
            GuardError::config(format!(
                "{} must be a whole number, got '{}'",
                SETTINGS_LABELS[index],
                self.fields[index].trim()
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

/// Screen state.
#[derive(Debug)]
pub struct App {
    pub running: bool,
    pub mode: Mode,
    pub tab: Tab,
    /// Byte offset into the query text.
    pub cursor: usize,
    pub review_input: String,
    pub settings: SettingsForm,
    pub log: Vec<LogEntry>,
    pub export_progress: Option<u64>,
    /// When the text was last edited and not yet estimated.
    pub last_edit: Option<Instant>,
    pub preview_scroll: usize,
    pub spinner: Option<Spinner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            running: true,
            mode: Mode::Editing,
            tab: Tab::Log,
            cursor: 0,
            review_input: String::new(),
            settings: SettingsForm::default(),
            log: Vec::new(),
            export_progress: None,
            last_edit: None,
            preview_scroll: 0,
            spinner: None,
        }
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Local::now(),
            level,
            message: message.into(),
        });
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, err: &GuardError) {
        self.log(LogLevel::Error, format!("{}: {err}", err.category()));
    }

    pub fn open_review(&mut self) {
        self.review_input.clear();
        self.mode = Mode::Review;
    }

    pub fn open_settings(&mut self, config: &Config) {
        self.settings = SettingsForm::from_config(config);
        self.mode = Mode::Settings;
    }

    pub fn close_dialog(&mut self) {
        self.review_input.clear();
        self.mode = Mode::Editing;
    }

    pub fn mark_edited(&mut self) {
        self.last_edit = Some(Instant::now());
    }

    pub fn start_spinner(&mut self, label: impl Into<String>) {
        self.spinner = Some(Spinner::new(label));
    }

    pub fn stop_spinner(&mut self) {
        self.spinner = None;
        self.export_progress = None;
    }

    pub fn scroll_preview(&mut self, delta: isize, rows: usize) {
        let max = rows.saturating_sub(1);
        self.preview_scroll = self.preview_scroll.saturating_add_signed(delta).min(max);
    }
}

/// Cursor arithmetic over the query text. Offsets are bytes on char boundaries.
pub mod cursor {
    pub fn prev(text: &str, at: usize) -> usize {
        text[..at.min(text.len())]
            .char_indices()
            .next_back()
            .map_or(0, |(i, _)| i)
    }

    pub fn next(text: &str, at: usize) -> usize {
        let at = at.min(text.len());
        text[at..]
            .chars()
            .next()
            .map_or(at, |c| at + c.len_utf8())
    }

    pub fn line_start(text: &str, at: usize) -> usize {
        text[..at.min(text.len())].rfind('\n').map_or(0, |i| i + 1)
    }

    pub fn line_end(text: &str, at: usize) -> usize {
        let at = at.min(text.len());
        text[at..].find('\n').map_or(text.len(), |i| at + i)
    }

    /// Zero-based line and column (in chars).
    pub fn line_col(text: &str, at: usize) -> (usize, usize) {
        let at = at.min(text.len());
        let line = text[..at].matches('\n').count();
        let col = text[line_start(text, at)..at].chars().count();
        (line, col)
    }

    /// Offset of `col` chars into the line starting at `start`, clamped to its end.
    fn at_col(text: &str, start: usize, col: usize) -> usize {
        let end = line_end(text, start);
        text[start..end]
            .char_indices()
            .nth(col)
            .map_or(end, |(i, _)| start + i)
    }

    pub fn up(text: &str, at: usize) -> usize {
        let start = line_start(text, at);
        if start == 0 {
            return at;
        }
        let (_, col) = line_col(text, at);
        at_col(text, line_start(text, start - 1), col)
    }

    pub fn down(text: &str, at: usize) -> usize {
        let end = line_end(text, at);
        if end == text.len() {
            return at;
        }
        let (_, col) = line_col(text, at);
        at_col(text, end + 1, col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_capped() {
        let mut app = App::new();
        for i in 0..(MAX_LOG_ENTRIES + 10) {
            app.info(format!("line {i}"));
        }
        assert_eq!(app.log.len(), MAX_LOG_ENTRIES);
        assert_eq!(app.log[0].message, "line 10");
    }

    #[test]
    fn test_error_uses_category() {
        let mut app = App::new();
        app.error(&GuardError::EmptyQuery);
        assert_eq!(app.log[0].level, LogLevel::Error);
        assert!(app.log[0].message.starts_with("Empty Query: "));
    }

    #[test]
    fn test_dialogs() {
        let mut app = App::new();
        app.open_review();
        app.review_input.push_str("RUN 1");
        assert_eq!(app.mode, Mode::Review);
        app.close_dialog();
        assert_eq!(app.mode, Mode::Editing);
        assert!(app.review_input.is_empty());
    }

    #[test]
    fn test_settings_form_parses_onto_config() {
        let mut form = SettingsForm::from_config(&Config::default());
        assert_eq!(form.fields[2], "50");
        assert_eq!(form.location(), None);

        *form.focused_mut() = "10".to_string();
        form.focus_next();
        *form.focused_mut() = " 20 ".to_string();
        form.focus_prev();
        form.focus_prev();
        assert_eq!(form.focus, 3);
        form.focused_mut().push_str("EU");

        let config = form.apply_to(&Config::default()).unwrap();
        assert_eq!(config.limits.warn_bytes, 10);
        assert_eq!(config.limits.block_bytes, 20);
        assert_eq!(config.app.preview_rows, 50);
        assert_eq!(config.app.default_location.as_deref(), Some("EU"));
    }

    #[test]
    fn test_settings_form_rejects_non_numbers() {
        let mut form = SettingsForm::from_config(&Config::default());
        form.fields[1] = "1GB".to_string();
        let err = form.apply_to(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("Block bytes"));
    }

    #[test]
    fn test_scroll_is_clamped() {
        let mut app = App::new();
        app.scroll_preview(5, 3);
        assert_eq!(app.preview_scroll, 2);
        app.scroll_preview(-10, 3);
        assert_eq!(app.preview_scroll, 0);
    }

    #[test]
    fn test_cursor_moves_over_multibyte_chars() {
        let text = "aé b";
        assert_eq!(cursor::next(text, 1), 3);
        assert_eq!(cursor::prev(text, 3), 1);
        assert_eq!(cursor::prev(text, 0), 0);
        assert_eq!(cursor::next(text, text.len()), text.len());
    }

    #[test]
    fn test_cursor_lines() {
        let text = "SELECT *\nFROM t\nWHERE x";
        let from = text.find("FROM").unwrap();
        assert_eq!(cursor::line_col(text, from + 2), (1, 2));
        assert_eq!(cursor::line_start(text, from + 2), from);
        assert_eq!(cursor::line_end(text, from), from + "FROM t".len());

        // "FR|OM t" -> "SE|LECT *" -> back down
        let up = cursor::up(text, from + 2);
        assert_eq!(up, 2);
        assert_eq!(cursor::down(text, up), from + 2);

        // Column clamps to a shorter line.
        let end_of_first = cursor::line_end(text, 0);
        let down = cursor::down(text, end_of_first);
        assert_eq!(down, from + "FROM t".len());
        assert_eq!(cursor::up(text, 0), 0);
    }
}
