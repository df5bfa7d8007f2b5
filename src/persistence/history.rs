//! Audit history of guarded steps.
//!
//! Every estimate review, execution and export appends one record. Records
//! are retention-pruned by age and by count.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::warn;

use super::StateDb;
use crate::error::{GuardError, Result};
use crate::guard::{Estimate, Fingerprint};
use crate::policy::Finding;
use crate::warehouse::TableRef;

const DEFAULT_MAX_ENTRIES: u32 = 5000;
const MAX_HISTORY_DAYS: i64 = 90;

/// Outcome recorded for a guarded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    #[serde(rename = "DRYRUN_FAILED")]
    DryRunFailed,
    Reviewed,
    Blocked,
    Executed,
    ExecFailed,
    Exported,
    Cancelled,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRunFailed => "DRYRUN_FAILED",
            Self::Reviewed => "REVIEWED",
            Self::Blocked => "BLOCKED",
            Self::Executed => "EXECUTED",
            Self::ExecFailed => "EXEC_FAILED",
            Self::Exported => "EXPORTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "DRYRUN_FAILED" => Self::DryRunFailed,
            "BLOCKED" => Self::Blocked,
            "EXECUTED" => Self::Executed,
            "EXEC_FAILED" => Self::ExecFailed,
            "EXPORTED" => Self::Exported,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Reviewed,
        }
    }
}

/// A record about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub status: HistoryStatus,
    pub sql: String,
    pub fingerprint: Fingerprint,
    pub dry_run_bytes: Option<u64>,
    pub referenced_tables: Vec<TableRef>,
    pub findings: Vec<Finding>,
    pub job_id: Option<String>,
    pub exported_file: Option<String>,
    pub error_message: Option<String>,
}

impl HistoryRecord {
    pub fn new(status: HistoryStatus, sql: &str) -> Self {
        Self {
            status,
            sql: sql.to_string(),
            fingerprint: Fingerprint::of(sql),
            dry_run_bytes: None,
            referenced_tables: Vec::new(),
            findings: Vec::new(),
            job_id: None,
            exported_file: None,
            error_message: None,
        }
    }

    /// A record carrying the estimate's SQL, bytes, tables and findings.
    pub fn for_estimate(status: HistoryStatus, estimate: &Estimate) -> Self {
        Self {
            status,
            sql: estimate.sql.clone(),
            fingerprint: estimate.fingerprint.clone(),
            dry_run_bytes: estimate.bytes_processed,
            referenced_tables: estimate.referenced_tables.clone(),
            findings: estimate.review.findings.clone(),
            job_id: None,
            exported_file: None,
            error_message: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_exported_file(mut self, path: impl Into<String>) -> Self {
        self.exported_file = Some(path.into());
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error_message = Some(error.to_string());
        self
    }
}

/// A stored history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub status: HistoryStatus,
    pub project: Option<String>,
    pub location: Option<String>,
    pub sql: String,
    pub fingerprint: String,
    pub dry_run_bytes: Option<i64>,
    pub referenced_tables: Vec<String>,
    pub findings: Vec<Finding>,
    pub job_id: Option<String>,
    pub exported_file: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
struct HistoryEntryRow {
    id: i64,
    status: String,
    project: Option<String>,
    location: Option<String>,
    sql: String,
    fingerprint: String,
    dry_run_bytes: Option<i64>,
    referenced_tables: String,
    findings: String,
    job_id: Option<String>,
    exported_file: Option<String>,
    error_message: Option<String>,
    created_at: String,
}

impl From<HistoryEntryRow> for HistoryEntry {
    fn from(row: HistoryEntryRow) -> Self {
        Self {
            id: row.id,
            status: HistoryStatus::from_str(&row.status),
            project: row.project,
            location: row.location,
            sql: row.sql,
            fingerprint: row.fingerprint,
            dry_run_bytes: row.dry_run_bytes,
            referenced_tables: serde_json::from_str(&row.referenced_tables).unwrap_or_default(),
            findings: serde_json::from_str(&row.findings).unwrap_or_default(),
            job_id: row.job_id,
            exported_file: row.exported_file,
            error_message: row.error_message,
            created_at: row.created_at,
        }
    }
}

/// Filter options for listing history.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<HistoryStatus>,
    pub text_search: Option<String>,
    pub limit: Option<i64>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| GuardError::persistence(format!("Failed to encode history field: {e}")))
}

/// Appends a record and prunes beyond `max_entries`.
pub async fn record(
    pool: &SqlitePool,
    project: Option<&str>,
    location: Option<&str>,
    record: &HistoryRecord,
    max_entries: u32,
) -> Result<i64> {
    let tables: Vec<String> = record
        .referenced_tables
        .iter()
        .map(ToString::to_string)
        .collect();
    let result = sqlx::query(
        r#"
        INSERT INTO guard_history
        (status, project, location, sql, fingerprint, dry_run_bytes, referenced_tables,
         findings, job_id, exported_file, error_message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.status.as_str())
    .bind(project)
    .bind(location)
    .bind(&record.sql)
    .bind(record.fingerprint.as_str())
    .bind(record.dry_run_bytes.map(|b| b as i64))
    .bind(to_json(&tables)?)
    .bind(to_json(&record.findings)?)
    .bind(record.job_id.as_deref())
    .bind(record.exported_file.as_deref())
    .bind(record.error_message.as_deref())
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to record history: {e}")))?;

    let id = result.last_insert_rowid();

    prune_old_entries(pool, max_entries).await?;

    Ok(id)
}

async fn prune_old_entries(pool: &SqlitePool, max_entries: u32) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM guard_history
        WHERE created_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ? || ' days')
        "#,
    )
    .bind(-MAX_HISTORY_DAYS)
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to prune old entries: {e}")))?;

    sqlx::query(
        r#"
        DELETE FROM guard_history
        WHERE id NOT IN (
            SELECT id FROM guard_history
            ORDER BY id DESC
            LIMIT ?
        )
        "#,
    )
    .bind(i64::from(max_entries))
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to prune excess entries: {e}")))?;

    Ok(())
}

/// Lists history entries, newest first.
pub async fn list_history(pool: &SqlitePool, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
    let mut query = String::from(
        r#"
        SELECT id, status, project, location, sql, fingerprint, dry_run_bytes,
               referenced_tables, findings, job_id, exported_file, error_message, created_at
        FROM guard_history
        WHERE 1=1
        "#,
    );

    if filter.status.is_some() {
        query.push_str(" AND status = ?");
    }
    if filter.text_search.is_some() {
        query.push_str(" AND sql LIKE ?");
    }

    query.push_str(" ORDER BY id DESC");

    if filter.limit.is_some() {
        query.push_str(" LIMIT ?");
    }

    let mut sqlx_query = sqlx::query_as::<_, HistoryEntryRow>(&query);

    if let Some(status) = filter.status {
        sqlx_query = sqlx_query.bind(status.as_str());
    }
    if let Some(ref text) = filter.text_search {
        sqlx_query = sqlx_query.bind(format!("%{text}%"));
    }
    if let Some(limit) = filter.limit {
        sqlx_query = sqlx_query.bind(limit);
    }

    let rows = sqlx_query
        .fetch_all(pool)
        .await
        .map_err(|e| GuardError::persistence(format!("Failed to list history: {e}")))?;

    Ok(rows.into_iter().map(HistoryEntry::from).collect())
}

/// Session-side history writer.
///
/// Stamps every record with the session's project and location. Write
/// failures are logged and otherwise ignored.
#[derive(Clone)]
pub struct HistoryLog {
    db: Arc<StateDb>,
    project: Option<String>,
    location: Option<String>,
    max_entries: u32,
}

impl HistoryLog {
    pub fn new(db: Arc<StateDb>, project: Option<String>, location: Option<String>) -> Self {
        Self {
            db,
            project,
            location,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: u32) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn set_location(&mut self, location: Option<String>) {
        self.location = location;
    }

    pub async fn append(&self, entry: HistoryRecord) {
        if let Err(e) = record(
            self.db.pool(),
            self.project.as_deref(),
            self.location.as_deref(),
            &entry,
            self.max_entries,
        )
        .await
        {
            warn!(status = entry.status.as_str(), error = %e, "Failed to write history");
        }
    }

    pub async fn list(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        list_history(self.db.pool(), filter).await
    }
}

impl std::fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLog")
            .field("db", &self.db.path())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
