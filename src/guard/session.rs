//! Session orchestration.
//!
//! [`GuardSession`] owns the buffer, the gate and their collaborators. Each
//! long-running operation is split in two: `begin_*` checks preconditions and
//! hands out a job that owns everything it needs, so it can run without
//! borrowing the session while the buffer stays editable; `finish_*` applies
//! the job's outcome. At most one job is in flight at a time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Approval, ApprovalGate, Estimate, Estimator, ExecutionResult, Executor, GatePhase, Intent,
    Operation, QueryBuffer,
};
use crate::config::Config;
use crate::error::{GuardError, Result};
use crate::export::{CsvSink, ExportKind, Exporter};
use crate::metadata::{MetadataCache, MetadataFetcher};
use crate::persistence::{HistoryLog, HistoryRecord, HistoryStatus};
use crate::policy::{self, PolicyRules};
use crate::warehouse::{ColumnInfo, JobMetadata, JobOptions, Row, TableMetadata, TableRef, WarehouseClient};

/// Rows shown in the preview grid for the last execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPreview {
    /// The text that was executed.
    pub sql: String,
    pub job: JobMetadata,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// True when the preview holds every row of the result.
    pub complete: bool,
}

/// A dry run detached from the session.
pub struct EstimateJob {
    revision: u64,
    text: String,
    estimator: Estimator,
    fetcher: MetadataFetcher,
    known_tables: HashSet<TableRef>,
}

/// What an [`EstimateJob`] produced.
pub struct EstimateOutcome {
    revision: u64,
    result: Result<Estimate>,
    fetched: Vec<TableMetadata>,
    fetch_errors: Vec<GuardError>,
}

impl EstimateJob {
    /// Buffer revision the dry run was started for.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Dry-runs the text, then fetches metadata for referenced tables that
    /// are not cached yet.
    pub async fn run(self, cancel: CancellationToken) -> EstimateOutcome {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GuardError::Cancelled { operation: Operation::Estimate }),
            result = self.estimator.estimate(&self.text) => result,
        };

        let mut fetched = Vec::new();
        let mut fetch_errors = Vec::new();
        if let Ok(estimate) = &result {
            let missing: Vec<TableRef> = estimate
                .referenced_tables
                .iter()
                .filter(|t| !self.known_tables.contains(*t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Metadata fetch abandoned");
                    }
                    (ok, errors) = self.fetcher.fetch_all(&missing) => {
                        fetched = ok;
                        fetch_errors = errors;
                    }
                }
            }
        }

        EstimateOutcome {
            revision: self.revision,
            result,
            fetched,
            fetch_errors,
        }
    }
}

/// An approved execution detached from the session.
pub struct ExecuteJob {
    buffer: QueryBuffer,
    approval: Approval,
    executor: Executor,
    preview_rows: usize,
}

/// What an [`ExecuteJob`] produced.
pub struct ExecuteOutcome {
    approval: Approval,
    sql: String,
    result: Result<ExecutionResult>,
}

impl ExecuteJob {
    pub fn approval(&self) -> &Approval {
        &self.approval
    }

    /// Submits the approved text and pulls the preview rows.
    ///
    /// Cancelling after submission asks the warehouse to stop the job.
    pub async fn run(self, cancel: CancellationToken) -> ExecuteOutcome {
        let submitted = self
            .executor
            .execute_with_cancel(&self.buffer, &self.approval, &cancel)
            .await;

        let result = match submitted {
            Ok(mut result) => {
                let job = result.job();
                let previewed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        if let Err(e) = job.cancel().await {
                            warn!(error = %e, "Job cancel request failed");
                        }
                        Err(GuardError::Cancelled { operation: Operation::Execute })
                    }
                    preview = result.preview(self.preview_rows) => preview.map(|_| ()),
                };
                previewed.map(|()| result)
            }
            Err(e) => Err(e),
        };

        ExecuteOutcome {
            approval: self.approval,
            sql: self.buffer.text().to_string(),
            result,
        }
    }
}

enum ExportSource {
    Preview {
        columns: Vec<ColumnInfo>,
        rows: Vec<Row>,
    },
    All(ExecutionResult),
}

/// A CSV export detached from the session.
pub struct ExportJob {
    kind: ExportKind,
    path: PathBuf,
    sql: String,
    exporter: Exporter,
    source: ExportSource,
}

/// What an [`ExportJob`] produced.
pub struct ExportOutcome {
    kind: ExportKind,
    path: PathBuf,
    sql: String,
    result: Result<u64>,
}

impl ExportJob {
    pub fn kind(&self) -> ExportKind {
        self.kind
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Writes the rows to the job's file, reporting progress per page.
    pub async fn run<F>(self, cancel: CancellationToken, progress: F) -> ExportOutcome
    where
        F: FnMut(u64) + Send,
    {
        let result = match CsvSink::create(&self.path) {
            Err(e) => Err(GuardError::export(0, e)),
            Ok(mut sink) => match self.source {
                ExportSource::Preview { columns, rows } => {
                    self.exporter.export_rows(&columns, &rows, &mut sink)
                }
                ExportSource::All(result) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(GuardError::Cancelled { operation: Operation::Export }),
                        written = self.exporter.export(result, &mut sink, progress) => written,
                    }
                }
            },
        };

        ExportOutcome {
            kind: self.kind,
            path: self.path,
            sql: self.sql,
            result,
        }
    }
}

/// Result of applying an operator intent.
#[derive(Debug)]
pub enum IntentOutcome {
    /// `None` when the estimate was superseded by an edit.
    Estimated(Option<Estimate>),
    Reviewing(Estimate),
    Approved(Approval),
    Phase(GatePhase),
    Executed(JobMetadata),
}

/// One operator's guarded workflow.
pub struct GuardSession {
    buffer: QueryBuffer,
    gate: ApprovalGate,
    estimator: Estimator,
    executor: Executor,
    exporter: Exporter,
    metadata: MetadataCache,
    rules: PolicyRules,
    history: Option<HistoryLog>,
    options: JobOptions,
    preview_rows: usize,
    in_flight: Option<Operation>,
    last_result: Option<ExecutionResult>,
    preview: Option<ResultPreview>,
    notices: Vec<String>,
}

impl GuardSession {
    pub fn new(
        client: Arc<dyn WarehouseClient>,
        config: &Config,
        project: Option<String>,
        location: impl Into<String>,
    ) -> Self {
        let mut options = JobOptions::new(project, location).with_labels(config.bq.labels.clone());
        options.use_query_cache = config.bq.use_query_cache;
        let rules = PolicyRules::from_config(config);

        Self {
            buffer: QueryBuffer::default(),
            gate: ApprovalGate::new(rules.allow_warnings()),
            estimator: Estimator::new(Arc::clone(&client), options.clone()),
            executor: Executor::new(Arc::clone(&client), options.clone(), config.app.page_size),
            exporter: Exporter::new(config.app.export_dir.clone(), config.app.page_size),
            metadata: MetadataCache::new(client),
            rules,
            history: None,
            options,
            preview_rows: config.app.preview_rows.max(1),
            in_flight: None,
            last_result: None,
            preview: None,
            notices: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: HistoryLog) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataCache) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    pub fn buffer(&self) -> &QueryBuffer {
        &self.buffer
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn phase(&self) -> GatePhase {
        self.gate.phase()
    }

    /// The held estimate, current or not.
    pub fn current_estimate(&self) -> Option<&Estimate> {
        self.gate.estimate()
    }

    pub fn is_estimate_current(&self) -> bool {
        self.gate.is_estimate_current(&self.buffer)
    }

    /// True when an unconsumed approval covers the current text.
    pub fn is_approved(&self) -> bool {
        self.gate.is_approved_for(&self.buffer)
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    pub fn project(&self) -> Option<String> {
        self.estimator.default_project()
    }

    pub fn location(&self) -> &str {
        &self.options.location
    }

    /// Rows kept for the preview grid.
    pub fn preview_rows(&self) -> usize {
        self.preview_rows
    }

    pub fn in_flight(&self) -> Option<Operation> {
        self.in_flight
    }

    pub fn preview(&self) -> Option<&ResultPreview> {
        self.preview.as_ref()
    }

    /// True while a result is held that "export all" can consume.
    pub fn has_result(&self) -> bool {
        self.last_result.is_some()
    }

    /// Messages for the operator's log, oldest first.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// Applies an edit to the buffer and reconciles the gate with it.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut QueryBuffer) -> R) -> R {
        let out = f(&mut self.buffer);
        self.gate.sync(&self.buffer);
        out
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.edit(|buffer| buffer.set_text(text))
    }

    fn claim(&mut self, operation: Operation) -> Result<()> {
        if let Some(running) = self.in_flight {
            return Err(GuardError::Busy { operation: running });
        }
        debug!(%operation, "Operation started");
        self.in_flight = Some(operation);
        Ok(())
    }

    fn release(&mut self, operation: Operation) {
        if self.in_flight == Some(operation) {
            self.in_flight = None;
        }
    }

    async fn record(&self, entry: HistoryRecord) {
        if let Some(history) = &self.history {
            history.append(entry).await;
        }
    }

    // ---- estimate ----

    /// Starts a dry run of the current text.
    ///
    /// Any approval is discarded. Blank text fails with `EmptyQuery` before
    /// anything else happens.
    pub fn begin_estimate(&mut self) -> Result<EstimateJob> {
        if let Some(running) = self.in_flight {
            return Err(GuardError::Busy { operation: running });
        }
        if self.buffer.is_blank() {
            return Err(GuardError::EmptyQuery);
        }
        self.claim(Operation::Estimate)?;
        self.gate.request_estimate();

        Ok(EstimateJob {
            revision: self.buffer.revision(),
            text: self.buffer.text().to_string(),
            estimator: self.estimator.clone(),
            fetcher: self.metadata.fetcher(),
            known_tables: self
                .metadata
                .entries()
                .into_iter()
                .map(|m| m.table.clone())
                .collect(),
        })
    }

    /// Applies a dry run's outcome.
    ///
    /// Returns `Ok(None)` when the buffer changed while the dry run was in
    /// flight; the result is discarded.
    pub async fn finish_estimate(&mut self, outcome: EstimateOutcome) -> Result<Option<Estimate>> {
        self.release(Operation::Estimate);

        for metadata in outcome.fetched {
            self.metadata.insert(metadata).await;
        }
        for error in outcome.fetch_errors {
            self.notices.push(error.to_string());
        }

        let stale = outcome.revision != self.buffer.revision();
        if outcome.result.is_err() {
            self.gate.estimate_abandoned(&self.buffer);
        }
        let estimate = match outcome.result {
            Ok(estimate) => estimate,
            Err(e @ GuardError::Estimation { .. }) => {
                if stale {
                    debug!(error = %e, "Ignoring failure of superseded dry run");
                    return Ok(None);
                }
                self.record(HistoryRecord::new(HistoryStatus::DryRunFailed, self.buffer.text()).with_error(&e))
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if stale {
            debug!(
                estimated = outcome.revision,
                current = self.buffer.revision(),
                "Discarding estimate for superseded text"
            );
            return Ok(None);
        }

        let review = policy::review(
            &estimate.sql,
            estimate.bytes_processed,
            &estimate.referenced_tables,
            &self.rules,
            |table| self.metadata.partitioning(table),
        );
        let estimate = estimate.with_review(review);
        info!(
            fingerprint = %estimate.fingerprint,
            bytes = %estimate.bytes_human(),
            findings = estimate.review.findings.len(),
            "Estimate ready"
        );
        self.gate.accept_estimate(estimate.clone(), outcome.revision);
        Ok(Some(estimate))
    }

    /// Dry-runs the current text.
    pub async fn estimate(&mut self) -> Result<Option<Estimate>> {
        let job = self.begin_estimate()?;
        let outcome = job.run(CancellationToken::new()).await;
        self.finish_estimate(outcome).await
    }

    // ---- review ----

    /// Opens the review for the current estimate and records it.
    pub async fn request_review(&mut self) -> Result<Estimate> {
        let estimate = self.gate.request_confirm(&self.buffer)?.clone();
        let status = if estimate.review.blocking_codes(self.rules.allow_warnings()).is_empty() {
            HistoryStatus::Reviewed
        } else {
            HistoryStatus::Blocked
        };
        self.record(HistoryRecord::for_estimate(status, &estimate)).await;
        Ok(estimate)
    }

    /// Opens the review, dry-running first when the estimate is missing or stale.
    pub async fn review(&mut self) -> Result<Estimate> {
        let spent = matches!(
            self.gate.phase(),
            GatePhase::Consumed | GatePhase::Invalidated
        );
        if (spent || !self.gate.is_estimate_current(&self.buffer))
            && self.estimate().await?.is_none()
        {
            return Err(GuardError::NoEstimate);
        }
        self.request_review().await
    }

    /// Confirms the open review with the typed phrase.
    pub fn confirm(&mut self, typed: &str) -> Result<Approval> {
        self.gate.confirm(&self.buffer, typed)
    }

    pub fn cancel_review(&mut self) {
        self.gate.cancel();
    }

    // ---- settings ----

    /// Applies edited limits, policy and preview size, and optionally moves
    /// later jobs to another location.
    ///
    /// The held estimate is reviewed again under the new rules, which drops
    /// any approval. Refused while an operation is in flight.
    pub fn apply_settings(&mut self, config: &Config, location: Option<&str>) -> Result<()> {
        if let Some(running) = self.in_flight {
            return Err(GuardError::Busy { operation: running });
        }
        self.rules = PolicyRules::from_config(config);
        self.preview_rows = config.app.preview_rows.max(1);

        if let Some(location) = location.filter(|l| *l != self.options.location) {
            info!(from = %self.options.location, to = location, "Job location changed");
            self.options.location = location.to_string();
            self.estimator.set_location(location);
            self.executor.set_location(location);
            if let Some(history) = &mut self.history {
                history.set_location(Some(location.to_string()));
            }
        }

        let allow_warnings = self.rules.allow_warnings();
        let review = self.gate.estimate().map(|estimate| {
            policy::review(
                &estimate.sql,
                estimate.bytes_processed,
                &estimate.referenced_tables,
                &self.rules,
                |table| self.metadata.partitioning(table),
            )
        });
        match review {
            Some(review) => self.gate.replace_review(review, allow_warnings),
            None => self.gate.set_allow_warnings(allow_warnings),
        }
        debug!(
            warn_bytes = self.rules.limits.warn_bytes,
            block_bytes = self.rules.limits.block_bytes,
            preview_rows = self.preview_rows,
            "Settings applied"
        );
        Ok(())
    }

    // ---- execute ----

    /// Starts the approved execution of the current text.
    pub fn begin_execute(&mut self) -> Result<ExecuteJob> {
        if let Some(running) = self.in_flight {
            return Err(GuardError::Busy { operation: running });
        }
        let approval = self.gate.approval_for_execution()?;
        self.claim(Operation::Execute)?;
        Ok(ExecuteJob {
            buffer: self.buffer.clone(),
            approval,
            executor: self.executor.clone(),
            preview_rows: self.preview_rows,
        })
    }

    /// Applies an execution's outcome and keeps the result for export.
    pub async fn finish_execute(&mut self, outcome: ExecuteOutcome) -> Result<JobMetadata> {
        self.release(Operation::Execute);
        self.gate.finish_execution(&outcome.approval);

        match outcome.result {
            Ok(result) => {
                let job = result.job_metadata().clone();
                let shown = self.preview_rows.min(result.preview_rows().len());
                self.preview = Some(ResultPreview {
                    sql: outcome.sql.clone(),
                    job: job.clone(),
                    columns: result.columns().to_vec(),
                    rows: result.preview_rows()[..shown].to_vec(),
                    complete: result.is_exhausted() && shown == result.preview_rows().len(),
                });
                self.last_result = Some(result);
                self.record(
                    HistoryRecord::for_estimate(HistoryStatus::Executed, outcome.approval.estimate())
                        .with_job_id(job.job_id.clone()),
                )
                .await;
                Ok(job)
            }
            Err(e) => {
                match &e {
                    GuardError::QueryDiverged { .. } => self.gate.invalidate(),
                    GuardError::Cancelled { .. } => {
                        self.record(HistoryRecord::new(HistoryStatus::Cancelled, &outcome.sql))
                            .await;
                    }
                    GuardError::Execution { .. } => {
                        self.record(
                            HistoryRecord::new(HistoryStatus::ExecFailed, &outcome.sql).with_error(&e),
                        )
                        .await;
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// Runs the approved query and pulls the preview.
    pub async fn execute(&mut self) -> Result<JobMetadata> {
        let job = self.begin_execute()?;
        let outcome = job.run(CancellationToken::new()).await;
        self.finish_execute(outcome).await
    }

    // ---- export ----

    /// Starts an export. "All" consumes the held result.
    pub fn begin_export(&mut self, kind: ExportKind) -> Result<ExportJob> {
        if let Some(running) = self.in_flight {
            return Err(GuardError::Busy { operation: running });
        }
        let Some(preview) = &self.preview else {
            return Err(GuardError::export(0, "no execution result to export"));
        };
        let sql = preview.sql.clone();
        let job_id = preview.job.job_id.clone();
        let source = match kind {
            ExportKind::Preview => ExportSource::Preview {
                columns: preview.columns.clone(),
                rows: preview.rows.clone(),
            },
            ExportKind::All => match self.last_result.take() {
                Some(result) => ExportSource::All(result),
                None => {
                    return Err(GuardError::export(
                        0,
                        "the result was already exported; execute again to re-read it",
                    ))
                }
            },
        };
        self.claim(Operation::Export)?;
        Ok(ExportJob {
            kind,
            path: self.exporter.path_for(Some(&job_id), kind),
            sql,
            exporter: self.exporter.clone(),
            source,
        })
    }

    pub async fn finish_export(&mut self, outcome: ExportOutcome) -> Result<(PathBuf, u64)> {
        self.release(Operation::Export);
        let rows = outcome.result?;
        info!(kind = %outcome.kind, path = %outcome.path.display(), rows, "Exported");
        self.record(
            HistoryRecord::new(HistoryStatus::Exported, &outcome.sql)
                .with_exported_file(outcome.path.display().to_string()),
        )
        .await;
        Ok((outcome.path, rows))
    }

    pub async fn export(&mut self, kind: ExportKind) -> Result<(PathBuf, u64)> {
        let job = self.begin_export(kind)?;
        let outcome = job.run(CancellationToken::new(), |_| {}).await;
        self.finish_export(outcome).await
    }

    // ---- metadata ----

    /// Refetches one table's metadata.
    pub async fn refresh_metadata(&mut self, table: &TableRef) -> Result<TableMetadata> {
        self.claim(Operation::MetadataRefresh)?;
        let result = self.metadata.refresh(table).await.cloned();
        self.release(Operation::MetadataRefresh);
        result
    }

    /// Empties the metadata cache; the next estimate refetches what it needs.
    pub async fn clear_metadata(&mut self) {
        self.metadata.clear().await;
        self.notices
            .push("Metadata cache cleared; the next estimate refetches".to_string());
    }

    /// Maps an operator intent onto the session operations.
    pub async fn apply(&mut self, intent: Intent) -> Result<IntentOutcome> {
        match intent {
            Intent::RequestEstimate => self.estimate().await.map(IntentOutcome::Estimated),
            Intent::RequestConfirm => self.review().await.map(IntentOutcome::Reviewing),
            Intent::Confirm(typed) => self.confirm(&typed).map(IntentOutcome::Approved),
            Intent::Cancel => {
                self.cancel_review();
                Ok(IntentOutcome::Phase(self.gate.phase()))
            }
            Intent::RequestExecute => self.execute().await.map(IntentOutcome::Executed),
        }
    }
}

impl std::fmt::Debug for GuardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardSession")
            .field("revision", &self.buffer.revision())
            .field("phase", &self.gate.phase())
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}
