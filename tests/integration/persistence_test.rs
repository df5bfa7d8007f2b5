//! Integration tests for the state database: audit history and the
//! persisted metadata cache.

use super::{session, session_with};
use bq_guard::config::Config;
use bq_guard::error::WarehouseError;
use bq_guard::export::ExportKind;
use bq_guard::metadata::MetadataCache;
use bq_guard::persistence::{HistoryFilter, HistoryLog, HistoryStatus, StateDb};
use bq_guard::policy::FindingCode;
use bq_guard::warehouse::{MockWarehouseClient, TableRef};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

async fn create_test_db() -> (Arc<StateDb>, TempDir) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let db = StateDb::open(&path).await.unwrap();
    (Arc::new(db), dir)
}

fn history(db: &Arc<StateDb>) -> HistoryLog {
    HistoryLog::new(
        Arc::clone(db),
        Some("mock-project".to_string()),
        Some("US".to_string()),
    )
}

async fn statuses(log: &HistoryLog) -> Vec<HistoryStatus> {
    let mut entries = log.list(&HistoryFilter::default()).await.unwrap();
    entries.reverse();
    entries.into_iter().map(|e| e.status).collect()
}

#[tokio::test]
async fn test_guarded_steps_are_recorded() {
    let (db, dir) = create_test_db().await;
    let log = history(&db);
    let client = MockWarehouseClient::new();
    let mut config = Config::default();
    config.app.export_dir = dir.path().join("exports");
    let mut s = session_with(&client, &config).with_history(log.clone());

    s.set_text("SELECT 1");
    let estimate = s.review().await.unwrap();
    s.confirm(&estimate.confirmation_phrase()).unwrap();
    s.execute().await.unwrap();
    let (path, _) = s.export(ExportKind::Preview).await.unwrap();

    assert_eq!(
        statuses(&log).await,
        vec![
            HistoryStatus::Reviewed,
            HistoryStatus::Executed,
            HistoryStatus::Exported
        ]
    );

    let entries = log.list(&HistoryFilter::default()).await.unwrap();
    let executed = entries
        .iter()
        .find(|e| e.status == HistoryStatus::Executed)
        .unwrap();
    assert_eq!(executed.project.as_deref(), Some("mock-project"));
    assert_eq!(executed.location.as_deref(), Some("US"));
    assert_eq!(executed.sql, "SELECT 1");
    assert_eq!(executed.fingerprint, estimate.fingerprint.as_str());
    assert_eq!(executed.dry_run_bytes, Some(1024));
    assert_eq!(executed.job_id.as_deref(), Some("mock_job_1"));
    assert_eq!(
        entries[0].exported_file.as_deref(),
        Some(path.display().to_string().as_str())
    );
}

#[tokio::test]
async fn test_failures_and_blocks_are_recorded() {
    let (db, _dir) = create_test_db().await;
    let log = history(&db);
    let client = MockWarehouseClient::demo();
    let mut s = session(&client).with_history(log.clone());

    client.fail_dry_run(Some(WarehouseError::network("down")));
    s.set_text("SELECT order_id FROM sales.orders");
    assert!(s.estimate().await.is_err());

    client.fail_dry_run(None);
    s.review().await.unwrap();

    s.set_text("SELECT order_id FROM sales.orders WHERE order_date = '2024-01-01'");
    let estimate = s.review().await.unwrap();
    s.confirm(&estimate.confirmation_phrase()).unwrap();
    client.fail_submit(Some(WarehouseError::api(400, "Syntax error")));
    assert!(s.execute().await.is_err());

    assert_eq!(
        statuses(&log).await,
        vec![
            HistoryStatus::DryRunFailed,
            HistoryStatus::Blocked,
            HistoryStatus::Reviewed,
            HistoryStatus::ExecFailed
        ]
    );

    let blocked = log
        .list(&HistoryFilter {
            status: Some(HistoryStatus::Blocked),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0]
        .findings
        .iter()
        .any(|f| f.code == FindingCode::PartitionMissing));
    assert_eq!(
        blocked[0].referenced_tables,
        vec!["mock-project.sales.orders".to_string()]
    );

    let failed = log
        .list(&HistoryFilter {
            status: Some(HistoryStatus::ExecFailed),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert!(failed[0]
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("Syntax error")));
}

#[tokio::test]
async fn test_history_is_pruned_to_max_entries() {
    let (db, _dir) = create_test_db().await;
    let log = history(&db).with_max_entries(3);
    let client = MockWarehouseClient::new();
    let mut s = session(&client).with_history(log.clone());

    for i in 0..5 {
        s.set_text(format!("SELECT {i}"));
        s.review().await.unwrap();
        s.cancel_review();
    }

    let entries = log.list(&HistoryFilter::default()).await.unwrap();
    let sql: Vec<&str> = entries.iter().map(|e| e.sql.as_str()).collect();
    assert_eq!(sql, vec!["SELECT 4", "SELECT 3", "SELECT 2"]);
}

#[tokio::test]
async fn test_metadata_cache_survives_restart() {
    let (db, _dir) = create_test_db().await;
    let client = MockWarehouseClient::demo();
    let orders = TableRef::new("mock-project", "sales", "orders");

    let mut first = MetadataCache::new(Arc::new(client.clone()))
        .with_store(Arc::clone(&db))
        .await;
    first.refresh(&orders).await.unwrap();
    assert_eq!(client.metadata_calls(), 1);

    let second = MetadataCache::new(Arc::new(client.clone()))
        .with_store(Arc::clone(&db))
        .await;
    let reloaded = second.get(&orders).unwrap();
    assert_eq!(Some(reloaded), first.get(&orders));
    assert_eq!(reloaded.partitioning.describe(), "time on order_date");
    assert_eq!(client.metadata_calls(), 1);
}

#[tokio::test]
async fn test_clearing_metadata_clears_the_store() {
    let (db, _dir) = create_test_db().await;
    let client = MockWarehouseClient::demo();
    let metadata = MetadataCache::new(Arc::new(client.clone()))
        .with_store(Arc::clone(&db))
        .await;
    let mut s = session(&client).with_metadata(metadata);

    s.set_text("SELECT order_id FROM sales.orders WHERE order_date = '2024-01-01'");
    s.estimate().await.unwrap();
    assert_eq!(s.metadata().len(), 1);
    s.take_notices();

    s.clear_metadata().await;
    assert!(s.metadata().is_empty());
    assert_eq!(s.take_notices().len(), 1);

    let reloaded = MetadataCache::new(Arc::new(client.clone()))
        .with_store(Arc::clone(&db))
        .await;
    assert!(reloaded.is_empty());
}
