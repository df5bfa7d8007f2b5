//! Event DSL for headless mode.
//!
//! Scripts are lines like `type:SELECT 1`, `key:ctrl+r`, `wait:100ms` or
//! `assert:state:phase=Approved`. Non-type lines may hold several events
//! separated by commas; a `type:` event always runs to the end of its line
//! because SQL is full of commas. `\n` inside typed text inserts a newline.

use super::HeadlessState;
use crate::error::{GuardError, Result};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::fmt;
use std::time::Duration;

/// An assertion to check against the screen or state.
#[derive(Debug, Clone)]
pub enum Assertion {
    /// Screen contains text (case-insensitive).
    Contains(String),
    /// Screen contains text (case-sensitive).
    ContainsExact(String),
    /// Screen does not contain text.
    NotContains(String),
    /// Screen matches regex pattern.
    Matches(String),
    /// State field equals value.
    StateEquals { field: String, value: String },
    /// State field comparison (>=, <=, >, <).
    StateCompare {
        field: String,
        op: String,
        value: String,
    },
}

impl Assertion {
    pub fn check(&self, screen: &str, state: &HeadlessState) -> bool {
        match self {
            Self::Contains(text) => screen.to_lowercase().contains(&text.to_lowercase()),
            Self::ContainsExact(text) => screen.contains(text),
            Self::NotContains(text) => !screen.to_lowercase().contains(&text.to_lowercase()),
            Self::Matches(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(screen))
                .unwrap_or(false),
            Self::StateEquals { field, value } => {
                state.field(field).as_deref() == Some(value.as_str())
            }
            Self::StateCompare { field, op, value } => {
                compare_values(state.field(field).as_deref(), op, value)
            }
        }
    }
}

fn compare_values(actual: Option<&str>, op: &str, expected: &str) -> bool {
    let Some(actual) = actual else {
        return false;
    };

    if let (Ok(a), Ok(e)) = (actual.parse::<i64>(), expected.parse::<i64>()) {
        return match op {
            ">=" => a >= e,
            "<=" => a <= e,
            ">" => a > e,
            "<" => a < e,
            _ => false,
        };
    }
    false
}

/// A parsed event.
#[derive(Debug, Clone)]
pub enum Event {
    Key(KeyEvent),
    /// Insert text at the cursor.
    Type(String),
    /// Sleep, then let debounced work and jobs settle.
    Wait(Duration),
    Resize(u16, u16),
    Snapshot(String),
    Assert(Assertion),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => {
                let mut parts = Vec::new();
                if key.modifiers.contains(KeyModifiers::CONTROL) {
                    parts.push("ctrl".to_string());
                }
                if key.modifiers.contains(KeyModifiers::ALT) {
                    parts.push("alt".to_string());
                }
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    parts.push("shift".to_string());
                }
                parts.push(key_code_to_string(&key.code));
                write!(f, "key:{}", parts.join("+"))
            }
            Self::Type(text) => write!(f, "type:{}", text.replace('\n', "\\n")),
            Self::Wait(d) => write!(f, "wait:{}ms", d.as_millis()),
            Self::Resize(w, h) => write!(f, "resize:{w}x{h}"),
            Self::Snapshot(name) => write!(f, "snapshot:{name}"),
            Self::Assert(a) => match a {
                Assertion::Contains(t) => write!(f, "assert:contains:{t}"),
                Assertion::ContainsExact(t) => write!(f, "assert:contains-exact:{t}"),
                Assertion::NotContains(t) => write!(f, "assert:not-contains:{t}"),
                Assertion::Matches(p) => write!(f, "assert:matches:{p}"),
                Assertion::StateEquals { field, value } => {
                    write!(f, "assert:state:{field}={value}")
                }
                Assertion::StateCompare { field, op, value } => {
                    write!(f, "assert:state:{field}{op}{value}")
                }
            },
        }
    }
}

fn key_code_to_string(code: &KeyCode) -> String {
    match code {
        KeyCode::Char(' ') => "space".to_string(),
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "enter".to_string(),
        KeyCode::Esc => "esc".to_string(),
        KeyCode::Tab => "tab".to_string(),
        KeyCode::Backspace => "backspace".to_string(),
        KeyCode::Delete => "delete".to_string(),
        KeyCode::Up => "up".to_string(),
        KeyCode::Down => "down".to_string(),
        KeyCode::Left => "left".to_string(),
        KeyCode::Right => "right".to_string(),
        KeyCode::Home => "home".to_string(),
        KeyCode::End => "end".to_string(),
        KeyCode::PageUp => "pageup".to_string(),
        KeyCode::PageDown => "pagedown".to_string(),
        _ => "unknown".to_string(),
    }
}

/// Parser for the event DSL.
#[derive(Debug, Default)]
pub struct EventParser;

impl EventParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses a whole script. Blank lines and `#` comments are skipped.
    pub fn parse_all(&self, input: &str) -> Result<Vec<Event>> {
        let mut events = Vec::new();

        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut rest = line;
            while !rest.is_empty() {
                if rest.to_lowercase().starts_with("type:") {
                    events.push(self.parse_one(rest)?);
                    break;
                }
                let (part, tail) = rest.split_once(',').unwrap_or((rest, ""));
                let part = part.trim();
                if !part.is_empty() {
                    events.push(self.parse_one(part)?);
                }
                rest = tail.trim_start();
            }
        }

        Ok(events)
    }

    pub fn parse_one(&self, input: &str) -> Result<Event> {
        let input = input.trim();

        let Some((event_type, value)) = input.split_once(':') else {
            return Err(GuardError::config(format!(
                "Invalid event syntax: '{input}'. Expected format: type:value"
            )));
        };

        match event_type.trim().to_lowercase().as_str() {
            "key" => self.parse_key(value.trim()),
            "type" => Ok(Event::Type(value.replace("\\n", "\n"))),
            "wait" => self.parse_wait(value.trim()),
            "resize" => self.parse_resize(value.trim()),
            "snapshot" => Ok(Event::Snapshot(value.trim().to_string())),
            "assert" => self.parse_assert(value.trim()),
            other => Err(GuardError::config(format!(
                "Unknown event type: '{other}'. Valid types: key, type, wait, resize, snapshot, assert"
            ))),
        }
    }

    /// Parses "enter", "ctrl+r", "shift+tab".
    fn parse_key(&self, value: &str) -> Result<Event> {
        let mut modifiers = KeyModifiers::empty();
        let (mods, key_str) = value.rsplit_once('+').unwrap_or(("", value));
        // A literal plus: "key:+" or "key:ctrl++"
        let (mods, key_str) = if key_str.is_empty() {
            (mods.strip_suffix('+').unwrap_or(mods), "+")
        } else {
            (mods, key_str)
        };

        for part in mods.split('+').filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "ctrl" | "control" => modifiers |= KeyModifiers::CONTROL,
                "alt" => modifiers |= KeyModifiers::ALT,
                "shift" => modifiers |= KeyModifiers::SHIFT,
                _ => {
                    return Err(GuardError::config(format!(
                        "Unknown modifier: '{part}'. Valid modifiers: ctrl, alt, shift"
                    )));
                }
            }
        }

        let code = parse_key_code(key_str)?;
        Ok(Event::Key(KeyEvent::new(code, modifiers)))
    }

    /// Parses "100ms", "2s", or a bare number of milliseconds.
    fn parse_wait(&self, value: &str) -> Result<Event> {
        let value = value.to_lowercase();
        let invalid = || GuardError::config(format!("Invalid duration: '{value}'"));

        let duration = if let Some(ms) = value.strip_suffix("ms") {
            Duration::from_millis(ms.parse().map_err(|_| invalid())?)
        } else if let Some(secs) = value.strip_suffix('s') {
            Duration::from_secs(secs.parse().map_err(|_| invalid())?)
        } else {
            Duration::from_millis(value.parse().map_err(|_| invalid())?)
        };

        Ok(Event::Wait(duration))
    }

    fn parse_resize(&self, value: &str) -> Result<Event> {
        let Some((w, h)) = value.split_once('x') else {
            return Err(GuardError::config(format!(
                "Invalid resize format: '{value}'. Expected WIDTHxHEIGHT"
            )));
        };
        let width: u16 = w
            .parse()
            .map_err(|_| GuardError::config(format!("Invalid width: '{w}'")))?;
        let height: u16 = h
            .parse()
            .map_err(|_| GuardError::config(format!("Invalid height: '{h}'")))?;
        Ok(Event::Resize(width, height))
    }

    fn parse_assert(&self, value: &str) -> Result<Event> {
        let Some((assert_type, rest)) = value.split_once(':') else {
            return Err(GuardError::config(format!(
                "Invalid assertion syntax: '{value}'. Expected assert:type:value"
            )));
        };
        let rest = rest.trim();

        let assertion = match assert_type.trim().to_lowercase().as_str() {
            "contains" => Assertion::Contains(rest.to_string()),
            "contains-exact" => Assertion::ContainsExact(rest.to_string()),
            "not-contains" => Assertion::NotContains(rest.to_string()),
            "matches" => Assertion::Matches(rest.to_string()),
            "state" => parse_state_assertion(rest)?,
            other => {
                return Err(GuardError::config(format!(
                    "Unknown assertion type: '{other}'. Valid types: contains, contains-exact, not-contains, matches, state"
                )));
            }
        };

        Ok(Event::Assert(assertion))
    }
}

fn parse_key_code(s: &str) -> Result<KeyCode> {
    let code = match s.to_lowercase().as_str() {
        "enter" | "return" => KeyCode::Enter,
        "esc" | "escape" => KeyCode::Esc,
        "tab" => KeyCode::Tab,
        "backspace" | "bs" => KeyCode::Backspace,
        "delete" | "del" => KeyCode::Delete,
        "up" => KeyCode::Up,
        "down" => KeyCode::Down,
        "left" => KeyCode::Left,
        "right" => KeyCode::Right,
        "home" => KeyCode::Home,
        "end" => KeyCode::End,
        "pageup" | "pgup" => KeyCode::PageUp,
        "pagedown" | "pgdn" => KeyCode::PageDown,
        "space" => KeyCode::Char(' '),
        _ => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => KeyCode::Char(c),
                _ => {
                    return Err(GuardError::config(format!(
                        "Unknown key: '{s}'. Use single characters or named keys like enter, esc, tab"
                    )));
                }
            }
        }
    };
    Ok(code)
}

/// Parses "phase=Approved" or "log_count>=2".
fn parse_state_assertion(value: &str) -> Result<Assertion> {
    for op in [">=", "<=", ">", "<", "="] {
        if let Some((field, val)) = value.split_once(op) {
            let field = field.trim().to_string();
            let value = val.trim().to_string();
            return Ok(if op == "=" {
                Assertion::StateEquals { field, value }
            } else {
                Assertion::StateCompare {
                    field,
                    op: op.to_string(),
                    value,
                }
            });
        }
    }

    Err(GuardError::config(format!(
        "Invalid state assertion: '{value}'. Expected field=value or field>=value"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Event {
        EventParser::new().parse_one(input).unwrap()
    }

    #[test]
    fn test_parse_key_enter() {
        match parse("key:enter") {
            Event::Key(key) => {
                assert_eq!(key.code, KeyCode::Enter);
                assert!(key.modifiers.is_empty());
            }
            other => panic!("Expected Key event, got {other}"),
        }
    }

    #[test]
    fn test_parse_key_with_modifier() {
        match parse("key:ctrl+r") {
            Event::Key(key) => {
                assert_eq!(key.code, KeyCode::Char('r'));
                assert!(key.modifiers.contains(KeyModifiers::CONTROL));
            }
            other => panic!("Expected Key event, got {other}"),
        }
    }

    #[test]
    fn test_parse_literal_plus() {
        match parse("key:+") {
            Event::Key(key) => assert_eq!(key.code, KeyCode::Char('+')),
            other => panic!("Expected Key event, got {other}"),
        }
    }

    #[test]
    fn test_parse_unknown_modifier() {
        assert!(EventParser::new().parse_one("key:hyper+x").is_err());
    }

    #[test]
    fn test_parse_type_keeps_spacing_and_newlines() {
        match parse("type:SELECT a,  b\\nFROM t") {
            Event::Type(text) => assert_eq!(text, "SELECT a,  b\nFROM t"),
            other => panic!("Expected Type event, got {other}"),
        }
    }

    #[test]
    fn test_parse_wait_units() {
        for (input, expected) in [
            ("wait:100ms", Duration::from_millis(100)),
            ("wait:2s", Duration::from_secs(2)),
            ("wait:100", Duration::from_millis(100)),
        ] {
            match parse(input) {
                Event::Wait(d) => assert_eq!(d, expected, "{input}"),
                other => panic!("Expected Wait event, got {other}"),
            }
        }
    }

    #[test]
    fn test_parse_resize() {
        assert!(matches!(parse("resize:120x40"), Event::Resize(120, 40)));
        assert!(EventParser::new().parse_one("resize:120").is_err());
    }

    #[test]
    fn test_parse_comma_separated() {
        let events = EventParser::new()
            .parse_all("key:ctrl+e,wait:100,key:ctrl+r")
            .unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_type_runs_to_end_of_line() {
        let events = EventParser::new()
            .parse_all("key:ctrl+l, type:SELECT a, b FROM t\nkey:ctrl+e")
            .unwrap();
        assert_eq!(events.len(), 3);
        match &events[1] {
            Event::Type(text) => assert_eq!(text, "SELECT a, b FROM t"),
            other => panic!("Expected Type event, got {other}"),
        }
    }

    #[test]
    fn test_parse_with_comments() {
        let script = r#"
# Estimate first
type:SELECT 1

# Then review
key:ctrl+r
"#;
        let events = EventParser::new().parse_all(script).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_parse_assert_contains() {
        match parse("assert:contains:No findings") {
            Event::Assert(Assertion::Contains(text)) => assert_eq!(text, "No findings"),
            other => panic!("Expected Assert Contains event, got {other}"),
        }
    }

    #[test]
    fn test_parse_assert_state() {
        match parse("assert:state:phase=Approved") {
            Event::Assert(Assertion::StateEquals { field, value }) => {
                assert_eq!(field, "phase");
                assert_eq!(value, "Approved");
            }
            other => panic!("Expected Assert StateEquals event, got {other}"),
        }
    }

    #[test]
    fn test_parse_assert_state_compare() {
        match parse("assert:state:log_count>=2") {
            Event::Assert(Assertion::StateCompare { field, op, value }) => {
                assert_eq!(field, "log_count");
                assert_eq!(op, ">=");
                assert_eq!(value, "2");
            }
            other => panic!("Expected Assert StateCompare event, got {other}"),
        }
    }

    #[test]
    fn test_display_round_trips_key() {
        assert_eq!(parse("key:ctrl+g").to_string(), "key:ctrl+g");
        assert_eq!(parse("key:space").to_string(), "key:space");
    }

    #[test]
    fn test_parse_invalid_event() {
        let parser = EventParser::new();
        assert!(parser.parse_one("invalid:event").is_err());
        assert!(parser.parse_one("no_colon").is_err());
        assert!(parser.parse_one("key:notakey").is_err());
    }

    #[test]
    fn test_compare_values() {
        assert!(compare_values(Some("3"), ">=", "2"));
        assert!(!compare_values(Some("1"), ">", "2"));
        assert!(!compare_values(Some("abc"), ">", "2"));
        assert!(!compare_values(None, "<", "2"));
    }
}
