//! Scripted runs of the terminal UI against the demo warehouse.

use super::session_with;
use bq_guard::cli::OutputFormat;
use bq_guard::config::Config;
use bq_guard::tui::headless::{HeadlessConfig, HeadlessOutput, HeadlessRunner};
use bq_guard::tui::Controller;
use bq_guard::warehouse::MockWarehouseClient;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn runner(client: &MockWarehouseClient, text: &str) -> (HeadlessRunner, TempDir) {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.app.export_dir = dir.path().join("exports");
    let session = session_with(client, &config).with_text(text);
    let controller = Controller::new(session, Duration::ZERO);
    let runner = HeadlessRunner::new(HeadlessConfig::default(), controller).unwrap();
    (runner, dir)
}

#[tokio::test]
async fn test_unfiltered_partitioned_scan_is_blocked_on_screen() {
    let client = MockWarehouseClient::demo();
    let (mut r, _dir) = runner(&client, "SELECT order_id FROM sales.orders");
    r.load_events(
        r#"
key:ctrl+r
assert:state:mode=Review
assert:contains:approval blocked
assert:contains:PARTITION_MISSING
type:RUN 1.5GB
key:enter
assert:state:approved=false
key:esc
assert:state:mode=Editing
"#,
    )
    .unwrap();

    let result = r.run().await.unwrap();
    assert_eq!(result.assertions_failed, 0, "{:?}", result.failures);
    assert_eq!(result.assertions_passed, 5);
    assert_eq!(client.submit_calls(), 0);
}

#[tokio::test]
async fn test_filtered_query_runs_and_exports() {
    let client = MockWarehouseClient::demo();
    let (mut r, dir) = runner(&client, "SELECT order_id FROM sales.orders ");
    r.load_events(
        r#"
# add the partition filter, then review
type:WHERE order_date = '2024-01-01'
key:ctrl+r
assert:contains:RUN 1.5GB
type:RUN 1.5GB
key:enter
assert:state:approved=true
key:ctrl+g
assert:state:phase=Consumed
assert:state:preview_rows=50
key:ctrl+s
assert:state:mode=Export
key:p
assert:state:in_flight=None
"#,
    )
    .unwrap();

    let result = r.run().await.unwrap();
    assert_eq!(result.assertions_failed, 0, "{:?}", result.failures);
    assert_eq!(
        client.submitted(),
        vec!["SELECT order_id FROM sales.orders WHERE order_date = '2024-01-01'".to_string()]
    );

    let exported: Vec<_> = std::fs::read_dir(dir.path().join("exports"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(exported.len(), 1);
    assert!(exported[0].ends_with("_mock_job_1_preview.csv"), "{exported:?}");
}

#[tokio::test]
async fn test_json_output_carries_state() {
    let client = MockWarehouseClient::new();
    let (mut r, _dir) = runner(&client, "SELECT 1");
    r.load_events("key:ctrl+e\nassert:state:phase=Estimated\nassert:state:approved=true")
        .unwrap();

    let result = r.run().await.unwrap();
    let output = HeadlessOutput::new(OutputFormat::Json).format(&result);
    let json: serde_json::Value = serde_json::from_str(&output).unwrap();

    assert_eq!(json["events_executed"], 3);
    assert_eq!(json["assertions"]["passed"], 1);
    assert_eq!(json["assertions"]["failed"], 1);
    assert_eq!(json["state"]["phase"], "Estimated");
    assert_eq!(json["state"]["query_text"], "SELECT 1");
    assert!(json["screen"].as_str().unwrap().contains("1.0KB"));
}

#[tokio::test]
async fn test_settings_dialog_tightens_block_limit() {
    let client = MockWarehouseClient::demo();
    let (mut r, _dir) = runner(
        &client,
        "SELECT order_id FROM sales.orders WHERE order_date = '2024-01-01'",
    );
    r.load_events(
        r#"
key:ctrl+o
assert:state:mode=Settings
assert:contains:Block bytes
# 100 GiB and 500 GiB cut to about 102 MiB and 512 MiB
key:backspace
key:backspace
key:backspace
key:tab
key:backspace
key:backspace
key:backspace
key:enter
assert:state:mode=Editing
key:ctrl+r
assert:contains:BYTES_BLOCK
"#,
    )
    .unwrap();

    let result = r.run().await.unwrap();
    assert_eq!(result.assertions_failed, 0, "{:?}", result.failures);
    assert_eq!(result.assertions_passed, 4);
    assert_eq!(client.dry_run_calls(), 1);
}
