//! Integration tests for exporting execution results.

use super::session_with;
use bq_guard::config::Config;
use bq_guard::error::{GuardError, WarehouseError};
use bq_guard::export::ExportKind;
use bq_guard::guard::GuardSession;
use bq_guard::warehouse::{ColumnInfo, MockWarehouseClient, Row, Value};
use tempfile::{tempdir, TempDir};

fn rows(n: i64) -> Vec<Row> {
    (1..=n)
        .map(|i| vec![Value::Int(i), Value::String(format!("name, {i}"))])
        .collect()
}

fn client(n: i64) -> MockWarehouseClient {
    MockWarehouseClient::new().with_rows(
        vec![ColumnInfo::new("id", "INT64"), ColumnInfo::new("name", "STRING")],
        rows(n),
    )
}

async fn executed(client: &MockWarehouseClient) -> (GuardSession, TempDir) {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.app.export_dir = dir.path().join("exports");
    config.app.preview_rows = 10;
    config.app.page_size = 7;

    let mut s = session_with(client, &config);
    s.set_text("SELECT id, name FROM t");
    let estimate = s.review().await.unwrap();
    s.confirm(&estimate.confirmation_phrase()).unwrap();
    s.execute().await.unwrap();
    (s, dir)
}

fn read_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn test_export_preview_writes_shown_rows() {
    let client = client(25);
    let (mut s, _dir) = executed(&client).await;
    assert_eq!(s.preview().map(|p| p.rows.len()), Some(10));

    let (path, written) = s.export(ExportKind::Preview).await.unwrap();
    assert_eq!(written, 10);
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with("_mock_job_1_preview.csv"), "{name}");

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 11);
    assert_eq!(lines[0], "id,name");
    assert_eq!(lines[1], "1,\"name, 1\"");

    // The preview can be exported again; the full result is still held.
    assert!(s.has_result());
    s.export(ExportKind::Preview).await.unwrap();
}

#[tokio::test]
async fn test_export_all_streams_every_row_once() {
    let client = client(25);
    let (mut s, _dir) = executed(&client).await;

    let (path, written) = s.export(ExportKind::All).await.unwrap();
    assert_eq!(written, 25);
    let lines = read_lines(&path);
    assert_eq!(lines.len(), 26);
    assert_eq!(lines.last().map(String::as_str), Some("25,\"name, 25\""));

    assert!(!s.has_result());
    let err = s.export(ExportKind::All).await.unwrap_err();
    assert!(matches!(err, GuardError::Export { rows_written: 0, .. }));
    assert_eq!(client.submit_calls(), 1);
}

#[tokio::test]
async fn test_export_reports_rows_written_before_failure() {
    let client = client(25);
    client.fail_paging(Some(WarehouseError::network("connection dropped")));
    let (mut s, _dir) = executed(&client).await;

    let err = s.export(ExportKind::All).await.unwrap_err();
    match err {
        GuardError::Export { rows_written, cause } => {
            assert_eq!(rows_written, 25);
            assert!(cause.contains("connection dropped"), "{cause}");
        }
        other => panic!("expected an export error, got {other}"),
    }
    assert!(s.in_flight().is_none());
}

#[tokio::test]
async fn test_export_without_execution_fails() {
    let client = client(3);
    let mut s = session_with(&client, &Config::default());
    s.set_text("SELECT 1");
    assert!(matches!(
        s.export(ExportKind::Preview).await,
        Err(GuardError::Export { rows_written: 0, .. })
    ));
}
