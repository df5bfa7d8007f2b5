//! Value and metadata types exchanged with the warehouse.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about a column in a result set or table schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type as reported by the warehouse (e.g. `INT64`).
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// A single cell value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text, and anything we keep in its wire form (NUMERIC, TIMESTAMP, RECORD).
    String(String),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value for display in the preview grid.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    /// Renders the value as a CSV field. NULL becomes an empty field.
    pub fn to_csv_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_display_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// Fully qualified table identifier (`project.dataset.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parses `project.dataset.table` or, given a default project,
    /// `dataset.table`. Surrounding backticks are ignored.
    pub fn parse(input: &str, default_project: Option<&str>) -> Option<Self> {
        let trimmed = input.trim().trim_matches('`');
        let parts: Vec<&str> = trimmed.split('.').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [project, dataset, table] => Some(Self::new(*project, *dataset, *table)),
            [dataset, table] => {
                let project = default_project.filter(|p| !p.is_empty())?;
                Some(Self::new(project, *dataset, *table))
            }
            _ => None,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// How a table is partitioned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Partitioning {
    #[default]
    None,
    /// Time partitioning. `column` is `None` for ingestion-time tables.
    Time { column: Option<String> },
    /// Integer range partitioning on `column`.
    Range { column: String },
}

impl Partitioning {
    pub fn is_partitioned(&self) -> bool {
        !matches!(self, Partitioning::None)
    }

    /// True for tables partitioned on load time (`_PARTITIONTIME`).
    pub fn is_ingestion_time(&self) -> bool {
        matches!(self, Partitioning::Time { column: None })
    }

    /// Column the filter must mention, for column-partitioned tables.
    pub fn key(&self) -> Option<&str> {
        match self {
            Partitioning::Time { column: Some(c) } | Partitioning::Range { column: c } => {
                Some(c.as_str())
            }
            _ => None,
        }
    }

    /// Short label used in the metadata panel.
    pub fn describe(&self) -> String {
        match self {
            Partitioning::None => "none".to_string(),
            Partitioning::Time { column: None } => "time (ingestion)".to_string(),
            Partitioning::Time { column: Some(c) } => format!("time on {c}"),
            Partitioning::Range { column } => format!("range on {column}"),
        }
    }
}

/// Descriptive metadata for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table: TableRef,
    pub partitioning: Partitioning,
    pub row_count: Option<u64>,
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    pub fetched_at: DateTime<Utc>,
}

impl TableMetadata {
    /// Metadata for an unpartitioned table with no statistics.
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            partitioning: Partitioning::None,
            row_count: None,
            size_bytes: None,
            columns: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_stats(mut self, row_count: u64, size_bytes: u64) -> Self {
        self.row_count = Some(row_count);
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// Whether a job is a dry run or a real execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    DryRun,
    Execute,
}

impl JobMode {
    pub fn label(&self) -> &'static str {
        match self {
            JobMode::DryRun => "dry-run",
            JobMode::Execute => "execute",
        }
    }
}

/// Per-job settings sent with every dry run and submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Billing project. `None` lets the client use its own default.
    pub project: Option<String>,
    pub location: String,
    pub labels: BTreeMap<String, String>,
    pub use_query_cache: bool,
}

impl JobOptions {
    pub fn new(project: Option<String>, location: impl Into<String>) -> Self {
        Self {
            project,
            location: location.into(),
            labels: BTreeMap::new(),
            use_query_cache: true,
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Copy of these options tagged with the job mode label.
    pub fn for_mode(&self, mode: JobMode) -> Self {
        let mut options = self.clone();
        options
            .labels
            .insert("mode".to_string(), mode.label().to_string());
        if mode == JobMode::DryRun {
            options.use_query_cache = false;
        }
        options
    }
}

/// Statistics reported by a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRunStats {
    pub bytes_processed: Option<u64>,
    /// Not every warehouse reports one; BigQuery does not.
    pub row_estimate: Option<u64>,
    pub referenced_tables: Vec<TableRef>,
    pub statement_type: Option<String>,
}

/// Identity and statistics of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobMetadata {
    pub job_id: String,
    pub project: String,
    pub location: Option<String>,
    pub total_bytes_processed: Option<u64>,
    pub total_rows: Option<u64>,
    pub cache_hit: Option<bool>,
}

impl JobMetadata {
    pub fn new(job_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            project: project.into(),
            location: None,
            total_bytes_processed: None,
            total_rows: None,
            cache_hit: None,
        }
    }
}
