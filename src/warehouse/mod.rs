//! Warehouse abstraction layer.
//!
//! The workflow only talks to the warehouse through [`WarehouseClient`], so the
//! BigQuery REST client and the in-memory mock are interchangeable.

mod bigquery;
pub mod gcloud;
mod mock;
mod types;

pub use bigquery::BigQueryClient;
pub use mock::{FailingWarehouseClient, MockWarehouseClient};
pub use types::{
    ColumnInfo, DryRunStats, JobMetadata, JobMode, JobOptions, Partitioning, Row, TableMetadata,
    TableRef, Value,
};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::WarehouseError;

/// Result type for warehouse calls.
pub type WarehouseResult<T> = std::result::Result<T, WarehouseError>;

/// Interface to the data warehouse.
///
/// Every call may suspend; callers run them off the UI loop.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Validates the query and reports projected cost without running it.
    async fn dry_run(&self, sql: &str, options: &JobOptions) -> WarehouseResult<DryRunStats>;

    /// Submits the query for real execution and returns a handle to the job.
    async fn submit(&self, sql: &str, options: &JobOptions)
        -> WarehouseResult<Arc<dyn JobHandle>>;

    /// Fetches descriptive metadata for a table.
    async fn table_metadata(&self, table: &TableRef) -> WarehouseResult<TableMetadata>;

    /// Billing project used when the job options do not name one.
    fn default_project(&self) -> Option<&str>;
}

/// A submitted job.
#[async_trait]
pub trait JobHandle: Send + Sync + fmt::Debug {
    fn metadata(&self) -> &JobMetadata;

    /// Waits for the job to finish and opens its result pages.
    async fn open_rows(&self, page_size: usize) -> WarehouseResult<RowStream>;

    /// Asks the warehouse to stop the job. Best effort.
    async fn cancel(&self) -> WarehouseResult<()>;
}

/// Result rows delivered page by page.
///
/// The stream is consumed once; it cannot be rewound.
pub struct RowStream {
    columns: Vec<ColumnInfo>,
    pages: BoxStream<'static, WarehouseResult<Vec<Row>>>,
}

impl RowStream {
    pub fn new(columns: Vec<ColumnInfo>, pages: BoxStream<'static, WarehouseResult<Vec<Row>>>) -> Self {
        Self { columns, pages }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn into_parts(self) -> (Vec<ColumnInfo>, BoxStream<'static, WarehouseResult<Vec<Row>>>) {
        (self.columns, self.pages)
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}
