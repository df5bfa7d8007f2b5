//! Persisted table metadata.
//!
//! Entries written under another cache version are ignored on load, so a
//! change to the stored shape only costs a refetch.

use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::error::{GuardError, Result};
use crate::warehouse::TableMetadata;

/// Version of the stored metadata payload.
pub const CACHE_VERSION: i64 = 1;

pub async fn save_table(pool: &SqlitePool, metadata: &TableMetadata) -> Result<()> {
    let payload = serde_json::to_string(metadata)
        .map_err(|e| GuardError::persistence(format!("Failed to encode table metadata: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO table_metadata (table_ref, cache_version, payload, fetched_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(table_ref) DO UPDATE SET
            cache_version = excluded.cache_version,
            payload = excluded.payload,
            fetched_at = excluded.fetched_at
        "#,
    )
    .bind(metadata.table.to_string())
    .bind(CACHE_VERSION)
    .bind(payload)
    .bind(metadata.fetched_at.to_rfc3339())
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to save table metadata: {e}")))?;

    Ok(())
}

/// Loads every entry stored under the current cache version.
pub async fn load_tables(pool: &SqlitePool) -> Result<Vec<TableMetadata>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT table_ref, payload FROM table_metadata WHERE cache_version = ? ORDER BY table_ref",
    )
    .bind(CACHE_VERSION)
    .fetch_all(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to load table metadata: {e}")))?;

    let mut tables = Vec::with_capacity(rows.len());
    for (table_ref, payload) in rows {
        match serde_json::from_str::<TableMetadata>(&payload) {
            Ok(metadata) => tables.push(metadata),
            Err(e) => debug!(table = %table_ref, error = %e, "Skipping unreadable cache entry"),
        }
    }
    Ok(tables)
}

pub async fn clear_tables(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM table_metadata")
        .execute(pool)
        .await
        .map_err(|e| GuardError::persistence(format!("Failed to clear table metadata: {e}")))?;
    Ok(result.rows_affected())
}
