//! Mock warehouse clients for tests and headless runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::{
    ColumnInfo, DryRunStats, JobHandle, JobMetadata, JobOptions, Row, RowStream, TableMetadata,
    TableRef, Value, WarehouseClient, WarehouseResult,
};
use crate::error::WarehouseError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MockState {
    project: String,
    bytes_processed: Mutex<u64>,
    row_estimate: Mutex<Option<u64>>,
    tables: Mutex<BTreeMap<TableRef, TableMetadata>>,
    result: Mutex<Option<(Vec<ColumnInfo>, Vec<Row>)>>,
    dry_run_error: Mutex<Option<WarehouseError>>,
    submit_error: Mutex<Option<WarehouseError>>,
    page_error: Mutex<Option<WarehouseError>>,
    submit_delay: Mutex<Option<Duration>>,
    submitted: Mutex<Vec<String>>,
    dry_run_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

/// An in-memory warehouse that returns configured answers and counts calls.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the session owns another.
#[derive(Clone)]
pub struct MockWarehouseClient {
    state: Arc<MockState>,
}

impl MockWarehouseClient {
    /// Creates a mock billing to `mock-project` that reports 1 KiB per dry run.
    pub fn new() -> Self {
        let state = MockState {
            project: "mock-project".to_string(),
            bytes_processed: Mutex::new(1024),
            ..MockState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// A small sample warehouse for `--mock-warehouse` runs.
    ///
    /// `sales.orders` is partitioned on `order_date`, `sales.customers` is not,
    /// and `events.raw` is ingestion-time partitioned. Dry runs report 1.5 GiB.
    pub fn demo() -> Self {
        let project = "mock-project";
        let columns = vec![
            ColumnInfo::new("order_id", "INT64"),
            ColumnInfo::new("order_date", "DATE"),
            ColumnInfo::new("amount", "FLOAT64"),
        ];
        let rows = (1..=120)
            .map(|i: i64| {
                vec![
                    Value::Int(i),
                    Value::String(format!("2024-01-{:02}", (i % 28) + 1)),
                    Value::Float(i as f64 * 9.5),
                ]
            })
            .collect();

        Self::new()
            .with_bytes(1_610_612_736)
            .with_table(
                TableMetadata::new(TableRef::new(project, "sales", "orders"))
                    .with_partitioning(super::Partitioning::Time {
                        column: Some("order_date".to_string()),
                    })
                    .with_stats(120, 1_610_612_736),
            )
            .with_table(
                TableMetadata::new(TableRef::new(project, "sales", "customers"))
                    .with_stats(40, 65_536),
            )
            .with_table(
                TableMetadata::new(TableRef::new(project, "events", "raw"))
                    .with_partitioning(super::Partitioning::Time { column: None }),
            )
            .with_rows(columns, rows)
    }

    pub fn with_bytes(self, bytes: u64) -> Self {
        self.set_bytes(bytes);
        self
    }

    pub fn with_row_estimate(self, rows: u64) -> Self {
        *lock(&self.state.row_estimate) = Some(rows);
        self
    }

    pub fn with_table(self, metadata: TableMetadata) -> Self {
        lock(&self.state.tables).insert(metadata.table.clone(), metadata);
        self
    }

    pub fn with_rows(self, columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        *lock(&self.state.result) = Some((columns, rows));
        self
    }

    pub fn with_submit_delay(self, delay: Duration) -> Self {
        *lock(&self.state.submit_delay) = Some(delay);
        self
    }

    pub fn set_bytes(&self, bytes: u64) {
        *lock(&self.state.bytes_processed) = bytes;
    }

    /// Makes every following dry run fail (or succeed again with `None`).
    pub fn fail_dry_run(&self, error: Option<WarehouseError>) {
        *lock(&self.state.dry_run_error) = error;
    }

    pub fn fail_submit(&self, error: Option<WarehouseError>) {
        *lock(&self.state.submit_error) = error;
    }

    /// Makes result paging fail after the last configured page.
    pub fn fail_paging(&self, error: Option<WarehouseError>) {
        *lock(&self.state.page_error) = error;
    }

    pub fn dry_run_calls(&self) -> usize {
        self.state.dry_run_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.state.submit_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.state.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.state.cancel_calls.load(Ordering::SeqCst)
    }

    /// Query texts passed to `submit`, in order.
    pub fn submitted(&self) -> Vec<String> {
        lock(&self.state.submitted).clone()
    }

    fn tables_mentioned(&self, sql: &str) -> Vec<TableRef> {
        let haystack = sql.to_lowercase();
        lock(&self.state.tables)
            .keys()
            .filter(|t| haystack.contains(&format!("{}.{}", t.dataset, t.table).to_lowercase()))
            .cloned()
            .collect()
    }
}

impl Default for MockWarehouseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseClient for MockWarehouseClient {
    async fn dry_run(&self, sql: &str, _options: &JobOptions) -> WarehouseResult<DryRunStats> {
        self.state.dry_run_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.state.dry_run_error).clone() {
            return Err(err);
        }
        Ok(DryRunStats {
            bytes_processed: Some(*lock(&self.state.bytes_processed)),
            row_estimate: *lock(&self.state.row_estimate),
            referenced_tables: self.tables_mentioned(sql),
            statement_type: sql
                .split_whitespace()
                .next()
                .map(|word| word.to_uppercase()),
        })
    }

    async fn submit(
        &self,
        sql: &str,
        _options: &JobOptions,
    ) -> WarehouseResult<Arc<dyn JobHandle>> {
        let seq = self.state.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.state.submitted).push(sql.to_string());

        let delay = *lock(&self.state.submit_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.state.submit_error).clone() {
            return Err(err);
        }

        let (columns, rows) = lock(&self.state.result).clone().unwrap_or_else(|| {
            (
                vec![ColumnInfo::new("result", "STRING")],
                vec![vec![Value::String(format!("Mock result for: {sql}"))]],
            )
        });

        let mut metadata = JobMetadata::new(format!("mock_job_{seq}"), self.state.project.clone());
        metadata.total_rows = Some(rows.len() as u64);
        metadata.total_bytes_processed = Some(*lock(&self.state.bytes_processed));
        metadata.cache_hit = Some(false);

        Ok(Arc::new(MockJob {
            metadata,
            columns,
            rows,
            state: Arc::clone(&self.state),
        }))
    }

    async fn table_metadata(&self, table: &TableRef) -> WarehouseResult<TableMetadata> {
        self.state.metadata_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.tables)
            .get(table)
            .cloned()
            .ok_or_else(|| WarehouseError::api(404, format!("Not found: Table {table}")))
    }

    fn default_project(&self) -> Option<&str> {
        Some(&self.state.project)
    }
}

#[derive(Debug)]
struct MockJob {
    metadata: JobMetadata,
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockState")
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobHandle for MockJob {
    fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    async fn open_rows(&self, page_size: usize) -> WarehouseResult<RowStream> {
        let mut pages: Vec<WarehouseResult<Vec<Row>>> = self
            .rows
            .chunks(page_size.max(1))
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        if let Some(err) = lock(&self.state.page_error).clone() {
            pages.push(Err(err));
        }
        Ok(RowStream::new(self.columns.clone(), stream::iter(pages).boxed()))
    }

    async fn cancel(&self) -> WarehouseResult<()> {
        self.state.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A warehouse client whose every call fails with a network error.
pub struct FailingWarehouseClient;

impl FailingWarehouseClient {
    fn error() -> WarehouseError {
        WarehouseError::network("simulated network failure")
    }
}

#[async_trait]
impl WarehouseClient for FailingWarehouseClient {
    async fn dry_run(&self, _sql: &str, _options: &JobOptions) -> WarehouseResult<DryRunStats> {
        Err(Self::error())
    }

    async fn submit(
        &self,
        _sql: &str,
        _options: &JobOptions,
    ) -> WarehouseResult<Arc<dyn JobHandle>> {
        Err(Self::error())
    }

    async fn table_metadata(&self, _table: &TableRef) -> WarehouseResult<TableMetadata> {
        Err(Self::error())
    }

    fn default_project(&self) -> Option<&str> {
        None
    }
}
