//! Headless mode for scripted testing and automation.
//!
//! Drives the same controller and renderer as the interactive terminal, but
//! against an in-memory backend. Every event waits for spawned jobs to settle
//! before the next one runs, so scripts are deterministic.

mod events;
mod output;

pub use events::{Assertion, Event, EventParser};
pub use output::{HeadlessOutput, ScreenRenderer};

use crate::cli::{Cli, OutputFormat};
use crate::error::{GuardError, Result};
use crate::tui::controller::Controller;
use crate::tui::ui;
use ratatui::backend::TestBackend;
use ratatui::layout::Rect;
use ratatui::Terminal;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a single event may wait for in-flight jobs.
const IDLE_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub width: u16,
    pub height: u16,
    pub output_format: OutputFormat,
    /// Stop on the first failed assertion.
    pub fail_fast: bool,
    /// None writes to stdout.
    pub output_file: Option<PathBuf>,
}

impl HeadlessConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let (width, height) = cli.parse_screen_size().map_err(GuardError::config)?;
        let output_format = cli.parse_output_format().map_err(GuardError::config)?;

        Ok(Self {
            width,
            height,
            output_format,
            fail_fast: cli.fail_fast,
            output_file: cli.output_file.clone(),
        })
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            width: 100,
            height: 30,
            output_format: OutputFormat::Text,
            fail_fast: false,
            output_file: None,
        }
    }
}

#[derive(Debug)]
pub struct HeadlessResult {
    pub screen: String,
    pub screen_lines: Vec<String>,
    pub events_executed: usize,
    pub duration: Duration,
    pub assertions_passed: usize,
    pub assertions_failed: usize,
    /// Failed assertions with the value observed.
    pub failures: Vec<String>,
    pub state: HeadlessState,
}

/// Snapshot of the session and screen state, addressable from assertions.
#[derive(Debug, Clone, Serialize)]
pub struct HeadlessState {
    pub query_text: String,
    pub revision: u64,
    pub phase: String,
    pub mode: String,
    pub tab: String,
    pub in_flight: Option<String>,
    pub estimate_current: bool,
    pub approved: bool,
    pub preview_rows: usize,
    pub log_count: usize,
    pub running: bool,
}

impl HeadlessState {
    fn capture(controller: &Controller) -> Self {
        let session = controller.session();
        let app = &controller.app;
        Self {
            query_text: session.buffer().text().to_string(),
            revision: session.buffer().revision(),
            phase: session.phase().to_string(),
            mode: app.mode.to_string(),
            tab: format!("{:?}", app.tab),
            in_flight: session.in_flight().map(|op| op.to_string()),
            estimate_current: session.is_estimate_current(),
            approved: session.is_approved(),
            preview_rows: session.preview().map_or(0, |p| p.rows.len()),
            log_count: app.log.len(),
            running: app.running,
        }
    }

    /// Looks up a field by name for state assertions.
    pub fn field(&self, name: &str) -> Option<String> {
        Some(match name {
            "query_text" => self.query_text.clone(),
            "revision" => self.revision.to_string(),
            "phase" => self.phase.clone(),
            "mode" => self.mode.clone(),
            "tab" => self.tab.clone(),
            "in_flight" => self.in_flight.clone().unwrap_or_else(|| "None".to_string()),
            "estimate_current" => self.estimate_current.to_string(),
            "approved" => self.approved.to_string(),
            "preview_rows" => self.preview_rows.to_string(),
            "log_count" => self.log_count.to_string(),
            "running" => self.running.to_string(),
            _ => return None,
        })
    }
}

pub struct HeadlessRunner {
    config: HeadlessConfig,
    terminal: Terminal<TestBackend>,
    controller: Controller,
    events: Vec<Event>,
}

impl HeadlessRunner {
    pub fn new(config: HeadlessConfig, controller: Controller) -> Result<Self> {
        let backend = TestBackend::new(config.width, config.height);
        let terminal = Terminal::new(backend)
            .map_err(|e| GuardError::internal(format!("Failed to create test terminal: {e}")))?;

        Ok(Self {
            config,
            terminal,
            controller,
            events: Vec::new(),
        })
    }

    pub fn load_events(&mut self, input: &str) -> Result<()> {
        self.events = EventParser::new().parse_all(input)?;
        Ok(())
    }

    /// Loads a script file, or stdin when `path` is "-".
    pub fn load_script(&mut self, path: &str) -> Result<()> {
        let content = if path == "-" {
            use std::io::Read;
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| GuardError::internal(format!("Failed to read stdin: {e}")))?;
            buffer
        } else {
            std::fs::read_to_string(path)
                .map_err(|e| GuardError::config(format!("Failed to read script file: {e}")))?
        };

        self.load_events(&content)
    }

    pub async fn run(mut self) -> Result<HeadlessResult> {
        let start = Instant::now();
        let mut events_executed = 0;
        let mut passed = 0;
        let mut failures = Vec::new();

        self.draw()?;

        for event in std::mem::take(&mut self.events) {
            debug!(event = %event, "Headless event");
            match &event {
                Event::Key(key) => {
                    self.controller.handle_key(*key).await;
                    self.settle().await;
                }
                Event::Type(text) => self.controller.insert_text(text),
                Event::Wait(duration) => {
                    tokio::time::sleep(*duration).await;
                    self.controller.tick();
                    self.settle().await;
                }
                Event::Resize(w, h) => {
                    self.terminal.backend_mut().resize(*w, *h);
                    self.terminal
                        .resize(Rect::new(0, 0, *w, *h))
                        .map_err(|e| GuardError::internal(format!("Resize failed: {e}")))?;
                }
                Event::Snapshot(name) => debug!(snapshot = %name, "Snapshot"),
                Event::Assert(assertion) => {
                    self.draw()?;
                    let screen = self.screen();
                    let state = HeadlessState::capture(&self.controller);
                    if assertion.check(&screen, &state) {
                        passed += 1;
                    } else {
                        failures.push(describe_failure(&event, assertion, &state));
                        if self.config.fail_fast {
                            events_executed += 1;
                            break;
                        }
                    }
                }
            }

            events_executed += 1;
            self.draw()?;

            if !self.controller.is_running() {
                break;
            }
        }

        self.draw()?;
        let screen = self.screen();
        let screen_lines = screen.lines().map(String::from).collect();

        Ok(HeadlessResult {
            screen,
            screen_lines,
            events_executed,
            duration: start.elapsed(),
            assertions_passed: passed,
            assertions_failed: failures.len(),
            failures,
            state: HeadlessState::capture(&self.controller),
        })
    }

    async fn settle(&mut self) {
        if !self.controller.wait_idle(IDLE_LIMIT).await {
            warn!("Job still running after {}s", IDLE_LIMIT.as_secs());
        }
    }

    fn draw(&mut self) -> Result<()> {
        let controller = &self.controller;
        self.terminal
            .draw(|frame| ui::render(frame, &controller.app, controller.session()))
            .map_err(|e| GuardError::internal(format!("Failed to render: {e}")))?;
        Ok(())
    }

    fn screen(&self) -> String {
        ScreenRenderer::render(self.terminal.backend().buffer())
    }
}

fn describe_failure(event: &Event, assertion: &Assertion, state: &HeadlessState) -> String {
    match assertion {
        Assertion::StateEquals { field, .. } | Assertion::StateCompare { field, .. } => {
            let actual = state.field(field).unwrap_or_else(|| "unknown field".to_string());
            format!("{event} (was {actual})")
        }
        _ => event.to_string(),
    }
}

/// Runs a headless script and returns the process exit code.
pub async fn run_headless(cli: &Cli, controller: Controller) -> Result<i32> {
    let config = HeadlessConfig::from_cli(cli)?;
    let mut runner = HeadlessRunner::new(config.clone(), controller)?;

    if let Some(ref events) = cli.events {
        runner.load_events(events)?;
    } else if let Some(ref script_path) = cli.script {
        runner.load_script(script_path)?;
    }

    let result = runner.run().await?;
    let output = HeadlessOutput::new(config.output_format).format(&result);

    if let Some(ref path) = config.output_file {
        std::fs::write(path, &output)
            .map_err(|e| GuardError::internal(format!("Failed to write output file: {e}")))?;
    } else {
        print!("{output}");
    }

    Ok(if result.assertions_failed > 0 { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::guard::GuardSession;
    use crate::warehouse::MockWarehouseClient;
    use std::sync::Arc;

    fn runner(client: &MockWarehouseClient, text: &str) -> HeadlessRunner {
        let session = GuardSession::new(
            Arc::new(client.clone()),
            &Config::default(),
            Some("mock-project".to_string()),
            "US",
        )
        .with_text(text);
        let controller = Controller::new(session, Duration::ZERO);
        HeadlessRunner::new(HeadlessConfig::default(), controller).unwrap()
    }

    #[tokio::test]
    async fn test_estimate_shows_on_screen() {
        let client = MockWarehouseClient::new();
        let mut r = runner(&client, "SELECT 1");
        r.load_events(
            "key:ctrl+e\nassert:state:phase=Estimated\nassert:contains:mock-project\nassert:contains:rev 1",
        )
        .unwrap();
        let result = r.run().await.unwrap();
        assert_eq!(result.assertions_failed, 0, "{:?}", result.failures);
        assert_eq!(result.assertions_passed, 3);
        assert_eq!(client.dry_run_calls(), 1);
    }

    #[tokio::test]
    async fn test_full_guarded_run() {
        let client = MockWarehouseClient::new();
        let mut r = runner(&client, "");
        r.load_events(
            r#"
type:SELECT 1
key:ctrl+r
assert:state:mode=Review
type:RUN 1.0KB
key:enter
assert:state:approved=true
key:ctrl+g
assert:state:phase=Consumed
assert:state:tab=Preview
"#,
        )
        .unwrap();
        let result = r.run().await.unwrap();
        assert_eq!(result.assertions_failed, 0, "{:?}", result.failures);
        assert_eq!(client.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_assertion_reports_actual_value() {
        let client = MockWarehouseClient::new();
        let mut r = runner(&client, "SELECT 1");
        r.load_events("assert:state:phase=Approved").unwrap();
        let result = r.run().await.unwrap();
        assert_eq!(result.assertions_failed, 1);
        assert_eq!(
            result.failures,
            vec!["assert:state:phase=Approved (was NoEstimate)".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fail_fast_stops() {
        let client = MockWarehouseClient::new();
        let session = GuardSession::new(Arc::new(client.clone()), &Config::default(), None, "US");
        let config = HeadlessConfig {
            fail_fast: true,
            ..HeadlessConfig::default()
        };
        let mut r = HeadlessRunner::new(config, Controller::new(session, Duration::ZERO)).unwrap();
        r.load_events("assert:contains:nowhere,key:ctrl+e,key:ctrl+e").unwrap();
        let result = r.run().await.unwrap();
        assert_eq!(result.events_executed, 1);
        assert_eq!(client.dry_run_calls(), 0);
    }

    #[tokio::test]
    async fn test_quit_ends_run() {
        let client = MockWarehouseClient::new();
        let mut r = runner(&client, "");
        r.load_events("key:ctrl+q,key:ctrl+e").unwrap();
        let result = r.run().await.unwrap();
        assert_eq!(result.events_executed, 1);
        assert!(!result.state.running);
    }
}
