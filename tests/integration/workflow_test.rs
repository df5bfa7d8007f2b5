//! End-to-end behavior of estimate, review, approve and execute.

use super::session;
use bq_guard::error::{GuardError, WarehouseError};
use bq_guard::guard::{
    Estimator, Executor, Fingerprint, GatePhase, Intent, IntentOutcome, QueryBuffer,
};
use bq_guard::policy::FindingCode;
use bq_guard::warehouse::{JobOptions, MockWarehouseClient, TableMetadata, TableRef};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_estimate_fingerprint_matches_text() {
    let client = MockWarehouseClient::new();
    let estimator = Estimator::new(
        Arc::new(client.clone()),
        JobOptions::new(Some("mock-project".to_string()), "US"),
    );

    for text in [
        "SELECT 1",
        "SELECT 1 ",
        "select 1",
        "SELECT\n  1",
        "SELECT 'é' AS accent",
    ] {
        let estimate = estimator.estimate(text).await.unwrap();
        assert_eq!(estimate.fingerprint, Fingerprint::of(text), "{text:?}");
        assert_eq!(estimate.sql, text);
    }
    assert_eq!(client.dry_run_calls(), 5);
}

#[tokio::test]
async fn test_empty_query_never_reaches_warehouse() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("   \n\t");

    assert!(matches!(s.estimate().await, Err(GuardError::EmptyQuery)));
    assert_eq!(client.dry_run_calls(), 0);
    assert_eq!(s.phase(), GatePhase::NoEstimate);
}

#[tokio::test]
async fn test_confirm_without_estimate_fails() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");

    // Fresh session.
    assert!(matches!(
        s.request_review().await,
        Err(GuardError::NoEstimate)
    ));

    // After a failed dry run.
    client.fail_dry_run(Some(WarehouseError::network("down")));
    assert!(s.estimate().await.is_err());
    assert!(matches!(
        s.request_review().await,
        Err(GuardError::NoEstimate)
    ));

    // After cancelling a review and editing away from the estimate.
    client.fail_dry_run(None);
    s.estimate().await.unwrap();
    s.request_review().await.unwrap();
    s.cancel_review();
    s.set_text("SELECT 2");
    assert!(s.request_review().await.is_err());
    assert!(!s.is_approved());
}

#[tokio::test]
async fn test_whitespace_edit_after_approval_diverges() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");
    let estimate = s.review().await.unwrap();
    let approval = s.confirm(&estimate.confirmation_phrase()).unwrap();

    for edited in ["SELECT 1 ", "SELECT  1", "select 1", "SELECT 1;"] {
        let buffer = QueryBuffer::new(edited);
        let executor = Executor::new(
            Arc::new(client.clone()),
            JobOptions::new(None, "US"),
            100,
        );
        let err = executor.execute(&buffer, &approval).await.unwrap_err();
        match err {
            GuardError::QueryDiverged { approved, current } => {
                assert_eq!(approved, Fingerprint::of("SELECT 1"));
                assert_eq!(current, Fingerprint::of(edited));
            }
            other => panic!("expected QueryDiverged for {edited:?}, got {other}"),
        }
    }
    assert_eq!(client.submit_calls(), 0);
    assert!(!approval.is_consumed());
}

#[tokio::test]
async fn test_spent_approval_is_refused_for_any_text() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");
    let estimate = s.review().await.unwrap();
    let approval = s.confirm(&estimate.confirmation_phrase()).unwrap();
    s.execute().await.unwrap();
    assert!(approval.is_consumed());

    let executor = Executor::new(Arc::new(client.clone()), JobOptions::new(None, "US"), 100);
    for text in ["SELECT 1", "SELECT 2"] {
        let err = executor
            .execute(&QueryBuffer::new(text), &approval)
            .await
            .unwrap_err();
        assert!(
            matches!(err, GuardError::ApprovalAlreadyConsumed { .. }),
            "{text}: {err}"
        );
    }
    assert_eq!(client.submit_calls(), 1);
}

#[tokio::test]
async fn test_failures_are_not_retried() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");
    s.estimate().await.unwrap();
    let estimated = s.estimate().await.unwrap().unwrap();
    assert_eq!(client.dry_run_calls(), 2);

    // A failed re-estimate makes one call and leaves the previous estimate.
    client.fail_dry_run(Some(WarehouseError::network("flaky")));
    let err = s.estimate().await.unwrap_err();
    assert!(matches!(err, GuardError::Estimation { .. }));
    assert_eq!(client.dry_run_calls(), 3);
    assert_eq!(s.phase(), GatePhase::Estimated);
    assert_eq!(
        s.current_estimate().map(|e| &e.fingerprint),
        Some(&estimated.fingerprint)
    );

    // A failed submission spends the approval after exactly one call.
    client.fail_dry_run(None);
    let estimate = s.review().await.unwrap();
    assert_eq!(estimate.fingerprint, estimated.fingerprint);
    s.confirm(&estimate.confirmation_phrase()).unwrap();
    client.fail_submit(Some(WarehouseError::api(403, "quota exceeded")));
    let err = s.execute().await.unwrap_err();
    assert!(matches!(err, GuardError::Execution { .. }));
    assert_eq!(client.submit_calls(), 1);
    assert_eq!(s.phase(), GatePhase::Consumed);
    assert!(matches!(
        s.execute().await,
        Err(GuardError::NotApproved { .. })
    ));
    assert_eq!(client.submit_calls(), 1);
}

#[tokio::test]
async fn test_scenario_estimate_confirm_execute() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");

    let estimate = assert_ok!(s.estimate().await).unwrap();
    let h1 = Fingerprint::of("SELECT 1");
    assert_eq!(estimate.fingerprint, h1);
    assert_eq!(s.phase(), GatePhase::Estimated);

    assert_ok!(s.request_review().await);
    assert_eq!(s.phase(), GatePhase::PendingConfirmation);
    let approval = assert_ok!(s.confirm("RUN 1.0KB"));
    assert_eq!(approval.fingerprint(), &h1);
    assert!(!approval.is_consumed());
    assert!(s.is_approved());

    let job = s.execute().await.unwrap();
    assert_eq!(job.job_id, "mock_job_1");
    assert!(approval.is_consumed());
    assert_eq!(s.phase(), GatePhase::Consumed);
    assert_eq!(client.submitted(), vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn test_scenario_extra_space_diverges() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");
    let estimate = s.review().await.unwrap();
    let approval = s.confirm(&estimate.confirmation_phrase()).unwrap();

    s.set_text("SELECT  1");
    assert_eq!(s.phase(), GatePhase::Invalidated);
    assert!(!s.is_approved());

    // Through the session the gate refuses; the executor refuses the
    // approval itself.
    assert!(matches!(
        s.execute().await,
        Err(GuardError::NotApproved { .. })
    ));
    let executor = Executor::new(Arc::new(client.clone()), JobOptions::new(None, "US"), 100);
    assert!(matches!(
        executor.execute(s.buffer(), &approval).await,
        Err(GuardError::QueryDiverged { .. })
    ));
    assert_eq!(client.submit_calls(), 0);
}

#[tokio::test]
async fn test_scenario_failed_estimate_then_confirm() {
    let client = MockWarehouseClient::new();
    client.fail_dry_run(Some(WarehouseError::network("connection reset")));
    let mut s = session(&client);
    s.set_text("SELECT 1");

    let err = assert_err!(s.estimate().await);
    assert_eq!(err.category(), "Estimation Error");
    assert_eq!(s.phase(), GatePhase::NoEstimate);
    assert!(matches!(
        s.apply(Intent::Confirm("RUN 1.0KB".to_string())).await,
        Err(GuardError::NotInReview { .. }) | Err(GuardError::NoEstimate)
    ));
    assert!(matches!(
        s.request_review().await,
        Err(GuardError::NoEstimate)
    ));
}

#[tokio::test]
async fn test_scenario_second_execute_refused() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");
    let estimate = s.review().await.unwrap();
    let approval = s.confirm(&estimate.confirmation_phrase()).unwrap();
    s.execute().await.unwrap();

    let executor = Executor::new(Arc::new(client.clone()), JobOptions::new(None, "US"), 100);
    assert!(matches!(
        executor.execute(s.buffer(), &approval).await,
        Err(GuardError::ApprovalAlreadyConsumed { .. })
    ));
    assert_eq!(client.submit_calls(), 1);
}

#[tokio::test]
async fn test_scenario_metadata_refresh_then_get() {
    let table = TableRef::new("mock-project", "dataset", "table");
    let client = MockWarehouseClient::new().with_table(
        TableMetadata::new(table.clone()).with_stats(10, 2048),
    );
    let mut s = session(&client);

    let unfetched = TableRef::parse("dataset.other", Some("mock-project")).unwrap();
    assert!(s.metadata().get(&unfetched).is_none());
    assert_eq!(client.metadata_calls(), 0);

    let parsed = TableRef::parse("dataset.table", Some("mock-project")).unwrap();
    let fetched = s.refresh_metadata(&parsed).await.unwrap();
    assert_eq!(fetched.row_count, Some(10));
    assert_eq!(s.metadata().get(&parsed), Some(&fetched));
    assert_eq!(client.metadata_calls(), 1);

    let missing = TableRef::new("mock-project", "dataset", "missing");
    let err = s.refresh_metadata(&missing).await.unwrap_err();
    assert!(matches!(err, GuardError::MetadataFetch { .. }));
    assert!(s.metadata().get(&missing).is_none());
}

#[tokio::test]
async fn test_intents_drive_the_workflow() {
    let client = MockWarehouseClient::new();
    let mut s = session(&client);
    s.set_text("SELECT 1");

    let outcome = s.apply(Intent::RequestConfirm).await.unwrap();
    let IntentOutcome::Reviewing(estimate) = outcome else {
        panic!("expected a review, got {outcome:?}");
    };
    assert!(matches!(
        s.apply(Intent::Confirm("RUN 2.0KB".to_string())).await,
        Err(GuardError::ConfirmationMismatch { .. })
    ));
    assert_eq!(s.phase(), GatePhase::PendingConfirmation);

    s.apply(Intent::Confirm(estimate.confirmation_phrase()))
        .await
        .unwrap();
    assert!(matches!(
        s.apply(Intent::RequestExecute).await.unwrap(),
        IntentOutcome::Executed(_)
    ));
}

#[tokio::test]
async fn test_partition_policy_blocks_until_filtered() {
    let client = MockWarehouseClient::demo();
    let mut s = session(&client);
    s.set_text("SELECT order_id FROM sales.orders");

    let estimate = s.review().await.unwrap();
    assert!(estimate
        .review
        .findings
        .iter()
        .any(|f| f.code == FindingCode::PartitionMissing));
    assert!(matches!(
        s.confirm(&estimate.confirmation_phrase()),
        Err(GuardError::PolicyBlocked { .. })
    ));
    assert!(!s.is_approved());

    s.set_text("SELECT order_id FROM sales.orders WHERE order_date >= '2024-01-01'");
    let estimate = s.review().await.unwrap();
    assert_eq!(estimate.confirmation_phrase(), "RUN 1.5GB");
    s.confirm("RUN 1.5GB").unwrap();
    s.execute().await.unwrap();
    assert_eq!(s.preview().map(|p| p.rows.len()), Some(50));
}
