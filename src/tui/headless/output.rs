//! Output formatting for headless mode.

use super::{HeadlessResult, HeadlessState};
use crate::cli::OutputFormat;
use ratatui::buffer::Buffer;
use serde::Serialize;

/// Renders a ratatui buffer to a string.
pub struct ScreenRenderer;

impl ScreenRenderer {
    /// Renders a buffer to plain text, trimming trailing blanks.
    pub fn render(buffer: &Buffer) -> String {
        let area = buffer.area;
        let mut lines: Vec<String> = (area.top()..area.bottom())
            .map(|y| {
                let line: String = (area.left()..area.right())
                    .map(|x| buffer[(x, y)].symbol())
                    .collect();
                line.trim_end_matches(' ').to_string()
            })
            .collect();

        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }

        format!("{}\n", lines.join("\n"))
    }
}

#[derive(Debug, Serialize)]
struct JsonOutput<'a> {
    screen: &'a str,
    screen_lines: &'a [String],
    events_executed: usize,
    duration_ms: u64,
    assertions: AssertionSummary<'a>,
    state: &'a HeadlessState,
}

#[derive(Debug, Serialize)]
struct AssertionSummary<'a> {
    passed: usize,
    failed: usize,
    failures: &'a [String],
}

/// Formats headless execution results.
pub struct HeadlessOutput {
    format: OutputFormat,
}

impl HeadlessOutput {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self, result: &HeadlessResult) -> String {
        match self.format {
            OutputFormat::Text => Self::format_text(result),
            OutputFormat::Json => Self::format_json(result),
        }
    }

    fn format_text(result: &HeadlessResult) -> String {
        let mut out = result.screen.clone();
        out.push_str(&format!(
            "\nEvents: {} executed in {}ms",
            result.events_executed,
            result.duration.as_millis()
        ));
        if result.assertions_passed > 0 || result.assertions_failed > 0 {
            out.push_str(&format!(
                " | Assertions: {} passed, {} failed",
                result.assertions_passed, result.assertions_failed
            ));
        }
        out.push('\n');
        for failure in &result.failures {
            out.push_str(&format!("FAILED {failure}\n"));
        }
        out
    }

    fn format_json(result: &HeadlessResult) -> String {
        let json_output = JsonOutput {
            screen: &result.screen,
            screen_lines: &result.screen_lines,
            events_executed: result.events_executed,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            assertions: AssertionSummary {
                passed: result.assertions_passed,
                failed: result.assertions_failed,
                failures: &result.failures,
            },
            state: &result.state,
        };

        serde_json::to_string_pretty(&json_output)
            .unwrap_or_else(|e| format!("{{\"error\": \"Failed to serialize: {e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::layout::Rect;
    use std::time::Duration;

    fn make_test_result() -> HeadlessResult {
        HeadlessResult {
            screen: "Test screen\nLine 2".to_string(),
            screen_lines: vec!["Test screen".to_string(), "Line 2".to_string()],
            events_executed: 3,
            duration: Duration::from_millis(150),
            assertions_passed: 2,
            assertions_failed: 1,
            failures: vec!["assert:state:phase=Approved (was Estimated)".to_string()],
            state: HeadlessState {
                query_text: "SELECT 1".to_string(),
                revision: 8,
                phase: "Estimated".to_string(),
                mode: "Editing".to_string(),
                tab: "Log".to_string(),
                in_flight: None,
                estimate_current: true,
                approved: false,
                preview_rows: 0,
                log_count: 1,
                running: true,
            },
        }
    }

    #[test]
    fn test_text_output() {
        let text = HeadlessOutput::new(OutputFormat::Text).format(&make_test_result());

        assert!(text.contains("Test screen"));
        assert!(text.contains("Events: 3 executed"));
        assert!(text.contains("Assertions: 2 passed, 1 failed"));
        assert!(text.contains("FAILED assert:state:phase=Approved"));
    }

    #[test]
    fn test_json_output() {
        let json = HeadlessOutput::new(OutputFormat::Json).format(&make_test_result());
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["events_executed"], 3);
        assert_eq!(parsed["state"]["phase"], "Estimated");
        assert_eq!(parsed["state"]["in_flight"], serde_json::Value::Null);
        assert_eq!(parsed["assertions"]["passed"], 2);
        assert!(parsed["assertions"]["failures"][0]
            .as_str()
            .unwrap()
            .starts_with("assert:"));
    }

    #[test]
    fn test_render_trims_trailing_blank_lines() {
        let mut buffer = Buffer::empty(Rect::new(0, 0, 10, 4));
        buffer.set_string(0, 0, "hello", ratatui::style::Style::default());
        assert_eq!(ScreenRenderer::render(&buffer), "hello\n");
    }

    #[test]
    fn test_render_empty_buffer() {
        let buffer = Buffer::empty(Rect::new(0, 0, 0, 0));
        assert_eq!(ScreenRenderer::render(&buffer), "\n");
    }
}
