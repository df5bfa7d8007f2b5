//! Schema versioning and migrations for the state database.
//!
//! Manages database schema evolution with forward-only migrations.

use crate::error::{GuardError, Result};
use sqlx::sqlite::SqlitePool;
use tracing::info;

const CURRENT_VERSION: i32 = 2;

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    ensure_schema_versions_table(pool).await?;

    let current = get_current_version(pool).await?;

    if current > CURRENT_VERSION {
        return Err(GuardError::persistence(format!(
            "Database schema version ({current}) is newer than supported version \
             ({CURRENT_VERSION}). Please upgrade bq-guard."
        )));
    }

    if current < CURRENT_VERSION {
        info!(
            "Migrating state database from version {} to {}",
            current, CURRENT_VERSION
        );
        run_pending_migrations(pool, current).await?;
    }

    Ok(())
}

async fn ensure_schema_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        GuardError::persistence(format!("Failed to create schema_versions table: {e}"))
    })?;

    Ok(())
}

async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_optional(pool)
        .await
        .map_err(|e| GuardError::persistence(format!("Failed to get schema version: {e}")))?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn run_pending_migrations(pool: &SqlitePool, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=CURRENT_VERSION {
        run_migration(pool, version).await?;
        record_version(pool, version).await?;
        info!("Applied migration v{}", version);
    }
    Ok(())
}

async fn record_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| GuardError::persistence(format!("Failed to record migration: {e}")))?;
    Ok(())
}

async fn run_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    match version {
        1 => migration_v1(pool).await,
        2 => migration_v2(pool).await,
        _ => Err(GuardError::persistence(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: audit history.
async fn migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS guard_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status TEXT NOT NULL CHECK (status IN (
                'DRYRUN_FAILED', 'REVIEWED', 'BLOCKED', 'EXECUTED',
                'EXEC_FAILED', 'EXPORTED', 'CANCELLED'
            )),
            project TEXT,
            location TEXT,
            sql TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            dry_run_bytes INTEGER,
            referenced_tables TEXT NOT NULL DEFAULT '[]',
            findings TEXT NOT NULL DEFAULT '[]',
            job_id TEXT,
            exported_file TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to create guard_history table: {e}")))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_guard_history_created
        ON guard_history(created_at)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to create history index: {e}")))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_guard_history_fingerprint
        ON guard_history(fingerprint)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to create history index: {e}")))?;

    Ok(())
}

/// Migration v2: persisted table metadata cache.
async fn migration_v2(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS table_metadata (
            table_ref TEXT PRIMARY KEY,
            cache_version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            fetched_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| GuardError::persistence(format!("Failed to create table_metadata table: {e}")))?;

    Ok(())
}
