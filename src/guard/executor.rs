//! Approved execution.
//!
//! The executor is the last line of defence: it re-derives the fingerprint of
//! the text it is about to submit and refuses anything the approval does not
//! cover.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Approval, Fingerprint, Operation, QueryBuffer};
use crate::error::{GuardError, Result, WarehouseError};
use crate::warehouse::{
    ColumnInfo, JobHandle, JobMetadata, JobMode, JobOptions, Row, WarehouseClient, WarehouseResult,
};

/// Submits approved queries.
#[derive(Clone)]
pub struct Executor {
    client: Arc<dyn WarehouseClient>,
    options: JobOptions,
    page_size: usize,
}

impl Executor {
    pub fn new(client: Arc<dyn WarehouseClient>, options: JobOptions, page_size: usize) -> Self {
        Self {
            client,
            options,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_location(&mut self, location: &str) {
        self.options.location = location.to_string();
    }

    /// Runs the buffer's text under `approval`.
    pub async fn execute(&self, buffer: &QueryBuffer, approval: &Approval) -> Result<ExecutionResult> {
        self.execute_with_cancel(buffer, approval, &CancellationToken::new())
            .await
    }

    /// Runs the buffer's text under `approval`, abandoning the submission if
    /// `cancel` fires first.
    ///
    /// Checks, in order: the approval is unspent, then its fingerprint equals
    /// the fingerprint of the buffer's current text. The approval is spent
    /// once the submission call resolves, whether it succeeded or failed. A
    /// cancelled submission leaves it unspent.
    ///
    /// Cancelling drops the pending `submit` call. If the warehouse had
    /// already accepted the job it keeps running, and the released approval
    /// can submit the same text again.
    pub async fn execute_with_cancel(
        &self,
        buffer: &QueryBuffer,
        approval: &Approval,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if approval.is_consumed() {
            return Err(GuardError::ApprovalAlreadyConsumed {
                fingerprint: approval.fingerprint().clone(),
            });
        }
        let current = buffer.fingerprint();
        if &current != approval.fingerprint() {
            warn!(approved = %approval.fingerprint(), %current, "Query diverged from approval");
            return Err(GuardError::QueryDiverged {
                approved: approval.fingerprint().clone(),
                current,
            });
        }
        approval.begin_use()?;

        info!(fingerprint = %current, "Submitting approved query");
        let options = self.options.for_mode(JobMode::Execute);
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                approval.release();
                info!(fingerprint = %current, "Submission cancelled before it resolved");
                return Err(GuardError::Cancelled { operation: Operation::Execute });
            }
            submitted = self.client.submit(buffer.text(), &options) => submitted,
        };
        approval.consume();

        match submitted {
            Ok(job) => {
                info!(fingerprint = %current, job_id = %job.metadata().job_id, "Query submitted");
                Ok(ExecutionResult::new(job, current, self.page_size))
            }
            Err(cause) => {
                warn!(fingerprint = %current, error = %cause, "Submission failed");
                Err(GuardError::Execution {
                    fingerprint: current,
                    cause,
                })
            }
        }
    }
}

type Pages = BoxStream<'static, WarehouseResult<Vec<Row>>>;

/// Rows of a submitted job, produced lazily and readable once.
///
/// Rows pulled for the preview are kept and replayed ahead of the rest of the
/// stream by [`ExecutionResult::into_rows`].
pub struct ExecutionResult {
    job: Arc<dyn JobHandle>,
    fingerprint: Fingerprint,
    page_size: usize,
    columns: Vec<ColumnInfo>,
    pages: Option<Pages>,
    prefix: Vec<Row>,
    exhausted: bool,
}

impl ExecutionResult {
    fn new(job: Arc<dyn JobHandle>, fingerprint: Fingerprint, page_size: usize) -> Self {
        Self {
            job,
            fingerprint,
            page_size,
            columns: Vec::new(),
            pages: None,
            prefix: Vec::new(),
            exhausted: false,
        }
    }

    pub fn job_metadata(&self) -> &JobMetadata {
        self.job.metadata()
    }

    /// Handle for cancelling the job while its rows are being read.
    pub fn job(&self) -> Arc<dyn JobHandle> {
        Arc::clone(&self.job)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Result columns. Empty until the rows were opened.
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Rows pulled so far.
    pub fn preview_rows(&self) -> &[Row] {
        &self.prefix
    }

    /// True once every row has been pulled into the preview.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn execution_error(&self, cause: WarehouseError) -> GuardError {
        GuardError::Execution {
            fingerprint: self.fingerprint.clone(),
            cause,
        }
    }

    async fn open(&mut self) -> Result<()> {
        if self.pages.is_some() || self.exhausted {
            return Ok(());
        }
        let stream = self
            .job
            .open_rows(self.page_size)
            .await
            .map_err(|cause| self.execution_error(cause))?;
        let (columns, pages) = stream.into_parts();
        self.columns = columns;
        self.pages = Some(pages);
        Ok(())
    }

    /// Pulls pages until at least `n` rows are buffered or the rows run out,
    /// and returns up to `n` of them.
    pub async fn preview(&mut self, n: usize) -> Result<&[Row]> {
        self.open().await?;
        while self.prefix.len() < n && !self.exhausted {
            let next = match self.pages.as_mut() {
                Some(pages) => pages.next().await,
                None => None,
            };
            match next {
                Some(Ok(page)) => self.prefix.extend(page),
                Some(Err(cause)) => return Err(self.execution_error(cause)),
                None => {
                    self.exhausted = true;
                    self.pages = None;
                }
            }
        }
        let shown = n.min(self.prefix.len());
        Ok(&self.prefix[..shown])
    }

    /// Consumes the result into its columns and a stream of every row,
    /// starting with the rows already previewed.
    pub async fn into_rows(mut self) -> Result<(Vec<ColumnInfo>, BoxStream<'static, Result<Row>>)> {
        self.open().await?;
        let fingerprint = self.fingerprint;
        let prefix = stream::iter(self.prefix.into_iter().map(Ok::<Row, WarehouseError>));
        let rest = match self.pages {
            Some(pages) => pages
                .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
                .try_flatten()
                .boxed(),
            None => stream::empty().boxed(),
        };
        let rows = prefix
            .chain(rest)
            .map_err(move |cause| GuardError::Execution {
                fingerprint: fingerprint.clone(),
                cause,
            })
            .boxed();
        Ok((self.columns, rows))
    }
}

impl fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("job", self.job.metadata())
            .field("fingerprint", &self.fingerprint)
            .field("previewed", &self.prefix.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{ApprovalGate, Estimator};
    use crate::warehouse::{MockWarehouseClient, Value};
    use std::time::Duration;

    fn options() -> JobOptions {
        JobOptions::new(None, "US")
    }

    async fn approve(client: &MockWarehouseClient, buffer: &QueryBuffer) -> (ApprovalGate, Approval) {
        let estimator = Estimator::new(Arc::new(client.clone()), options());
        let estimate = estimator.estimate(buffer.text()).await.unwrap();
        let phrase = estimate.confirmation_phrase();
        let mut gate = ApprovalGate::new(true);
        gate.accept_estimate(estimate, buffer.revision());
        gate.request_confirm(buffer).unwrap();
        let approval = gate.confirm(buffer, &phrase).unwrap();
        (gate, approval)
    }

    fn numbered(n: i64) -> MockWarehouseClient {
        let rows = (0..n).map(|i| vec![Value::Int(i)]).collect();
        MockWarehouseClient::new().with_rows(vec![ColumnInfo::new("n", "INT64")], rows)
    }

    #[tokio::test]
    async fn test_execute_consumes_approval() {
        let client = MockWarehouseClient::new();
        let buffer = QueryBuffer::new("SELECT 1");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client.clone()), options(), 10);

        let result = executor.execute(&buffer, &approval).await.unwrap();
        assert!(approval.is_consumed());
        assert_eq!(result.fingerprint(), &buffer.fingerprint());
        assert_eq!(client.submitted(), vec!["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn test_whitespace_edit_diverges() {
        let client = MockWarehouseClient::new();
        let mut buffer = QueryBuffer::new("SELECT 1");
        let (_, approval) = approve(&client, &buffer).await;
        buffer.insert_char(buffer.text().len(), ' ');

        let executor = Executor::new(Arc::new(client.clone()), options(), 10);
        let err = executor.execute(&buffer, &approval).await.unwrap_err();
        assert!(matches!(err, GuardError::QueryDiverged { .. }));
        assert!(!approval.is_consumed());
        assert_eq!(client.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_consumed_check_comes_first() {
        let client = MockWarehouseClient::new();
        let mut buffer = QueryBuffer::new("SELECT 1");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client.clone()), options(), 10);
        executor.execute(&buffer, &approval).await.unwrap();

        buffer.set_text("SELECT 2");
        let err = executor.execute(&buffer, &approval).await.unwrap_err();
        assert!(matches!(err, GuardError::ApprovalAlreadyConsumed { .. }));
        assert_eq!(client.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_submission_still_consumes() {
        let client = MockWarehouseClient::new();
        client.fail_submit(Some(WarehouseError::api(400, "quota exceeded")));
        let buffer = QueryBuffer::new("SELECT 1");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client.clone()), options(), 10);

        let err = executor.execute(&buffer, &approval).await.unwrap_err();
        assert!(matches!(err, GuardError::Execution { .. }));
        assert!(approval.is_consumed());
        assert_eq!(client.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_submit_resolves_keeps_approval() {
        let client = MockWarehouseClient::new().with_submit_delay(Duration::from_secs(30));
        let buffer = QueryBuffer::new("SELECT 1");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client.clone()), options(), 10);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute_with_cancel(&buffer, &approval, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::Cancelled {
                operation: Operation::Execute
            }
        ));
        assert!(!approval.is_consumed());
        assert!(!approval.is_in_flight());
    }

    #[tokio::test]
    async fn test_preview_then_stream_replays_prefix() {
        let client = numbered(25);
        let buffer = QueryBuffer::new("SELECT n");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client.clone()), options(), 10);

        let mut result = executor.execute(&buffer, &approval).await.unwrap();
        let preview = result.preview(5).await.unwrap();
        assert_eq!(preview.len(), 5);
        assert_eq!(result.preview_rows().len(), 10);
        assert!(!result.is_exhausted());

        let (columns, rows) = result.into_rows().await.unwrap();
        assert_eq!(columns[0].name, "n");
        let rows: Vec<Row> = rows.try_collect().await.unwrap();
        assert_eq!(rows.len(), 25);
        assert_eq!(rows[0], vec![Value::Int(0)]);
        assert_eq!(rows[24], vec![Value::Int(24)]);
    }

    #[tokio::test]
    async fn test_preview_larger_than_result() {
        let client = numbered(3);
        let buffer = QueryBuffer::new("SELECT n");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client), options(), 2);

        let mut result = executor.execute(&buffer, &approval).await.unwrap();
        assert_eq!(result.preview(50).await.unwrap().len(), 3);
        assert!(result.is_exhausted());
        let (_, rows) = result.into_rows().await.unwrap();
        let rows: Vec<Row> = rows.try_collect().await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_paging_failure_is_execution_error() {
        let client = numbered(4);
        client.fail_paging(Some(WarehouseError::network("reset")));
        let buffer = QueryBuffer::new("SELECT n");
        let (_, approval) = approve(&client, &buffer).await;
        let executor = Executor::new(Arc::new(client), options(), 2);

        let mut result = executor.execute(&buffer, &approval).await.unwrap();
        let err = result.preview(10).await.unwrap_err();
        assert!(matches!(err, GuardError::Execution { .. }));
    }
}
