//! Key handling and job plumbing between the screen and the session.
//!
//! Warehouse calls run as spawned tasks so the loop keeps drawing and the
//! buffer stays editable; their outcomes come back over a channel and are
//! applied to the session in arrival order.

use std::path::PathBuf;
use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::app::{cursor, App, Mode, Tab};
use crate::config::Config;
use crate::error::GuardError;
use crate::export::ExportKind;
use crate::guard::{
    human_bytes, EstimateOutcome, ExecuteOutcome, ExportOutcome, GatePhase, GuardSession,
    Operation, QueryBuffer,
};

/// Outcomes of spawned jobs.
pub enum JobMessage {
    Estimated {
        outcome: EstimateOutcome,
        /// Open the review once the estimate lands.
        then_review: bool,
    },
    Executed(ExecuteOutcome),
    ExportProgress(u64),
    Exported(ExportOutcome),
}

pub struct Controller {
    pub app: App,
    session: GuardSession,
    tx: mpsc::Sender<JobMessage>,
    rx: mpsc::Receiver<JobMessage>,
    cancel: Option<CancellationToken>,
    /// Zero disables the automatic estimate.
    debounce: Duration,
    /// Settings as last loaded or saved.
    config: Config,
    /// Where saved settings are written. `None` keeps them in memory.
    config_path: Option<PathBuf>,
}

impl Controller {
    pub fn new(session: GuardSession, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let mut app = App::new();
        app.cursor = session.buffer().text().len();
        if !session.buffer().is_blank() {
            app.mark_edited();
        }
        Self {
            app,
            session,
            tx,
            rx,
            cancel: None,
            debounce,
            config: Config::default(),
            config_path: None,
        }
    }

    /// Sets the configuration the settings dialog edits and saves.
    pub fn with_config(mut self, config: Config, path: Option<PathBuf>) -> Self {
        self.config = config;
        self.config_path = path;
        self
    }

    pub fn session(&self) -> &GuardSession {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.app.running
    }

    pub async fn recv(&mut self) -> Option<JobMessage> {
        self.rx.recv().await
    }

    /// Applies outcomes until nothing is in flight, or `limit` passes.
    ///
    /// Returns false on timeout.
    pub async fn wait_idle(&mut self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.session.in_flight().is_some() {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => self.handle_message(message).await,
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    pub async fn handle_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        if ctrl && matches!(key.code, KeyCode::Char('q') | KeyCode::Char('c')) {
            self.quit();
            return;
        }
        match self.app.mode {
            Mode::Review => self.handle_review_key(key),
            Mode::Export => self.handle_export_key(key),
            Mode::Settings => self.handle_settings_key(key),
            Mode::Editing if ctrl => self.handle_command(key.code).await,
            Mode::Editing => self.handle_edit_key(key),
        }
    }

    /// Inserts text as if typed: into the query, the confirmation prompt, or
    /// the focused settings field.
    pub fn insert_text(&mut self, text: &str) {
        match self.app.mode {
            Mode::Review => self.app.review_input.push_str(text),
            Mode::Settings => self.app.settings.focused_mut().push_str(text),
            Mode::Editing if !text.is_empty() => {
                let at = self.app.cursor;
                self.edit(|buffer| buffer.insert_str(at, text));
                self.app.cursor = at + text.len();
            }
            _ => {}
        }
    }

    /// Starts the automatic estimate once the text has been quiet long enough.
    pub fn tick(&mut self) {
        let Some(edited) = self.app.last_edit else {
            return;
        };
        if self.debounce.is_zero()
            || edited.elapsed() < self.debounce
            || self.session.in_flight().is_some()
            || self.app.mode != Mode::Editing
        {
            return;
        }
        self.app.last_edit = None;
        if self.session.buffer().is_blank() || self.session.is_estimate_current() {
            return;
        }
        debug!("Automatic estimate after edit");
        self.start_estimate(false);
    }

    fn quit(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.app.running = false;
    }

    // ---- editing ----

    fn edit(&mut self, f: impl FnOnce(&mut QueryBuffer)) {
        let was_approved = self.session.phase() == GatePhase::Approved;
        let before = self.session.buffer().revision();
        self.session.edit(f);
        if self.session.buffer().revision() == before {
            return;
        }
        self.app.mark_edited();
        if was_approved && self.session.phase() != GatePhase::Approved {
            self.app
                .warn("Query changed after approval; approval discarded, review again");
        }
    }

    fn handle_edit_key(&mut self, key: KeyEvent) {
        let text = self.session.buffer().text();
        let at = self.app.cursor.min(text.len());
        match key.code {
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::ALT) => {
                self.edit(|buffer| buffer.insert_char(at, c));
                self.app.cursor = at + c.len_utf8();
            }
            KeyCode::Enter => {
                self.edit(|buffer| buffer.insert_char(at, '\n'));
                self.app.cursor = at + 1;
            }
            KeyCode::Tab => self.insert_text("  "),
            KeyCode::Backspace if at > 0 => {
                let start = cursor::prev(text, at);
                self.edit(|buffer| {
                    buffer.remove(start..at);
                });
                self.app.cursor = start;
            }
            KeyCode::Delete if at < text.len() => {
                let end = cursor::next(text, at);
                self.edit(|buffer| {
                    buffer.remove(at..end);
                });
            }
            KeyCode::Left => self.app.cursor = cursor::prev(text, at),
            KeyCode::Right => self.app.cursor = cursor::next(text, at),
            KeyCode::Up => self.app.cursor = cursor::up(text, at),
            KeyCode::Down => self.app.cursor = cursor::down(text, at),
            KeyCode::Home => self.app.cursor = cursor::line_start(text, at),
            KeyCode::End => self.app.cursor = cursor::line_end(text, at),
            KeyCode::PageUp => {
                let rows = self.preview_len();
                self.app.scroll_preview(-10, rows);
            }
            KeyCode::PageDown => {
                let rows = self.preview_len();
                self.app.scroll_preview(10, rows);
            }
            KeyCode::Esc => self.cancel_in_flight(),
            _ => {}
        }
    }

    fn preview_len(&self) -> usize {
        self.session.preview().map_or(0, |p| p.rows.len())
    }

    // ---- commands ----

    async fn handle_command(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('e') => self.start_estimate(false),
            KeyCode::Char('r') => self.review().await,
            KeyCode::Char('g') => self.start_execute(),
            KeyCode::Char('s') => self.open_export(),
            KeyCode::Char('t') => self.refresh_metadata().await,
            KeyCode::Char('l') => self.app.tab = self.app.tab.toggle(),
            KeyCode::Char('o') => self.open_settings(),
            _ => {}
        }
    }

    fn cancel_in_flight(&mut self) {
        if let (Some(operation), Some(token)) = (self.session.in_flight(), self.cancel.take()) {
            self.app.warn(format!("Cancelling {operation}..."));
            token.cancel();
        }
    }

    fn arm(&mut self, operation: Operation) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        let label = match operation {
            Operation::Estimate => "Estimating",
            Operation::Execute => "Executing",
            Operation::Export => "Exporting",
            Operation::MetadataRefresh => "Refreshing metadata",
        };
        self.app.start_spinner(label);
        token
    }

    fn start_estimate(&mut self, then_review: bool) {
        let job = match self.session.begin_estimate() {
            Ok(job) => job,
            Err(e) => return self.app.error(&e),
        };
        self.app.last_edit = None;
        let token = self.arm(Operation::Estimate);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = job.run(token).await;
            if tx
                .send(JobMessage::Estimated {
                    outcome,
                    then_review,
                })
                .await
                .is_err()
            {
                debug!("Screen closed before the estimate finished");
            }
        });
    }

    async fn review(&mut self) {
        if let Some(operation) = self.session.in_flight() {
            return self.app.error(&GuardError::Busy { operation });
        }
        if self.session.is_approved() {
            self.app.info("Already approved; press Ctrl+G to run");
            return;
        }
        let spent = matches!(
            self.session.phase(),
            GatePhase::Consumed | GatePhase::Invalidated | GatePhase::NoEstimate
        );
        if spent || !self.session.is_estimate_current() {
            self.start_estimate(true);
        } else {
            self.open_review().await;
        }
    }

    async fn open_review(&mut self) {
        match self.session.request_review().await {
            Ok(estimate) => {
                let blocking = estimate
                    .review
                    .blocking_codes(self.session.rules().allow_warnings());
                if !blocking.is_empty() {
                    self.app
                        .warn(format!("Approval blocked by policy: {}", blocking.join(", ")));
                }
                self.app.open_review();
            }
            Err(e) => self.app.error(&e),
        }
    }

    fn handle_review_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                self.session.cancel_review();
                self.app.close_dialog();
                self.app.info("Review cancelled");
            }
            KeyCode::Enter => {
                let typed = std::mem::take(&mut self.app.review_input);
                match self.session.confirm(&typed) {
                    Ok(approval) => {
                        self.app.close_dialog();
                        self.app.info(format!(
                            "Approved {} ({}); press Ctrl+G to run",
                            approval.fingerprint().short(),
                            approval.estimate().bytes_human()
                        ));
                    }
                    Err(e @ GuardError::StaleEstimate { .. }) => {
                        self.app.close_dialog();
                        self.app.error(&e);
                    }
                    Err(e) => self.app.error(&e),
                }
            }
            KeyCode::Backspace => {
                self.app.review_input.pop();
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.app.review_input.push(c);
            }
            _ => {}
        }
    }

    fn start_execute(&mut self) {
        let job = match self.session.begin_execute() {
            Ok(job) => job,
            Err(e) => return self.app.error(&e),
        };
        let token = self.arm(Operation::Execute);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = job.run(token).await;
            if tx.send(JobMessage::Executed(outcome)).await.is_err() {
                debug!("Screen closed before the execution finished");
            }
        });
    }

    fn open_export(&mut self) {
        if let Some(operation) = self.session.in_flight() {
            return self.app.error(&GuardError::Busy { operation });
        }
        if self.session.preview().is_none() {
            self.app
                .error(&GuardError::export(0, "no execution result to export"));
            return;
        }
        self.app.mode = Mode::Export;
    }

    fn handle_export_key(&mut self, key: KeyEvent) {
        let kind = match key.code {
            KeyCode::Char('p') => ExportKind::Preview,
            KeyCode::Char('a') => ExportKind::All,
            KeyCode::Esc => return self.app.close_dialog(),
            _ => return,
        };
        self.app.close_dialog();
        let job = match self.session.begin_export(kind) {
            Ok(job) => job,
            Err(e) => return self.app.error(&e),
        };
        self.app
            .info(format!("Exporting {kind} to {}", job.path().display()));
        let token = self.arm(Operation::Export);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let outcome = job
                .run(token, move |rows| {
                    // Progress is advisory; a full channel just skips an update.
                    let _ = progress_tx.try_send(JobMessage::ExportProgress(rows));
                })
                .await;
            if tx.send(JobMessage::Exported(outcome)).await.is_err() {
                debug!("Screen closed before the export finished");
            }
        });
    }

    // ---- settings ----

    fn open_settings(&mut self) {
        if let Some(operation) = self.session.in_flight() {
            return self.app.error(&GuardError::Busy { operation });
        }
        self.app.open_settings(&self.config);
    }

    fn handle_settings_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                self.app.close_dialog();
                self.app.info("Settings unchanged");
            }
            KeyCode::Enter => self.save_settings(),
            KeyCode::Tab | KeyCode::Down => self.app.settings.focus_next(),
            KeyCode::BackTab | KeyCode::Up => self.app.settings.focus_prev(),
            KeyCode::Backspace => {
                self.app.settings.focused_mut().pop();
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.app.settings.focused_mut().push(c);
            }
            _ => {}
        }
    }

    /// Validates the form, writes it to the config file, applies it to the
    /// session and re-estimates. A field that does not parse keeps the dialog open.
    fn save_settings(&mut self) {
        let mut config = match self.app.settings.apply_to(&self.config) {
            Ok(config) => config,
            Err(e) => return self.app.error(&e),
        };
        for warning in config.validate() {
            self.app.warn(warning);
        }
        if let Err(e) = self
            .session
            .apply_settings(&config, config.app.default_location.as_deref())
        {
            return self.app.error(&e);
        }
        self.app.close_dialog();

        match &self.config_path {
            Some(path) => match config.write_to(path) {
                Ok(()) => {
                    info!(path = %path.display(), "Settings saved");
                    self.app.info("Settings saved.");
                }
                Err(e) => {
                    self.app.error(&e);
                    self.app.warn("Settings apply to this session only");
                }
            },
            None => self.app.info("Settings applied to this session"),
        }
        self.config = config;

        if !self.session.buffer().is_blank() {
            self.start_estimate(false);
        }
    }

    async fn refresh_metadata(&mut self) {
        if let Some(operation) = self.session.in_flight() {
            return self.app.error(&GuardError::Busy { operation });
        }
        self.session.clear_metadata().await;
        self.drain_notices();
        if !self.session.buffer().is_blank() {
            self.start_estimate(false);
        }
    }

    fn drain_notices(&mut self) {
        for notice in self.session.take_notices() {
            self.app.warn(notice);
        }
    }

    // ---- outcomes ----

    pub async fn handle_message(&mut self, message: JobMessage) {
        match message {
            JobMessage::ExportProgress(rows) => {
                self.app.export_progress = Some(rows);
                return;
            }
            JobMessage::Estimated {
                outcome,
                then_review,
            } => {
                self.finish_job();
                let result = self.session.finish_estimate(outcome).await;
                self.drain_notices();
                match result {
                    Ok(Some(estimate)) => {
                        self.app.info(format!(
                            "Estimate: {} for {}",
                            estimate.bytes_human(),
                            estimate.fingerprint.short()
                        ));
                        if then_review {
                            self.open_review().await;
                        }
                    }
                    Ok(None) => {
                        if then_review {
                            self.app
                                .warn("Query changed while estimating; press Ctrl+R again");
                        }
                    }
                    Err(e) => self.app.error(&e),
                }
            }
            JobMessage::Executed(outcome) => {
                self.finish_job();
                match self.session.finish_execute(outcome).await {
                    Ok(job) => {
                        let shown = self.preview_len();
                        self.app.info(format!(
                            "Job {} done: {} rows, {} processed; showing {shown}",
                            job.job_id,
                            job.total_rows
                                .map_or_else(|| "?".to_string(), |n| n.to_string()),
                            job.total_bytes_processed
                                .map_or_else(|| "?".to_string(), human_bytes),
                        ));
                        self.app.preview_scroll = 0;
                        self.app.tab = Tab::Preview;
                    }
                    Err(e) => self.app.error(&e),
                }
            }
            JobMessage::Exported(outcome) => {
                self.finish_job();
                match self.session.finish_export(outcome).await {
                    Ok((path, rows)) => self
                        .app
                        .info(format!("Exported {rows} rows to {}", path.display())),
                    Err(e) => self.app.error(&e),
                }
            }
        }
    }

    fn finish_job(&mut self) {
        self.cancel = None;
        self.app.stop_spinner();
    }
}
