//! Dry-run estimates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::Fingerprint;
use crate::error::{GuardError, Result};
use crate::policy::{self, PolicyReport};
use crate::warehouse::{JobMode, JobOptions, TableRef, WarehouseClient};

/// Formats a byte count with binary units and one decimal (`1.5GB`).
/// Values below 1024 are shown as whole bytes (`512B`).
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = UNITS[0];
    for candidate in UNITS {
        value /= 1024.0;
        unit = candidate;
        if value < 1024.0 {
            break;
        }
    }
    format!("{value:.1}{unit}")
}

/// Projected cost of running one exact query text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub fingerprint: Fingerprint,
    /// The exact text that was dry-run.
    pub sql: String,
    pub bytes_processed: Option<u64>,
    pub row_estimate: Option<u64>,
    pub statement_type: Option<String>,
    pub referenced_tables: Vec<TableRef>,
    /// Filled in by the session once metadata for the tables is available.
    pub review: PolicyReport,
    pub created_at: DateTime<Utc>,
}

impl Estimate {
    pub fn bytes_human(&self) -> String {
        human_bytes(self.bytes_processed.unwrap_or(0))
    }

    /// Text the operator must type to approve this estimate.
    pub fn confirmation_phrase(&self) -> String {
        format!("RUN {}", self.bytes_human())
    }

    pub fn with_review(mut self, review: PolicyReport) -> Self {
        self.review = review;
        self
    }
}

/// Runs dry runs through the warehouse client.
#[derive(Clone)]
pub struct Estimator {
    client: Arc<dyn WarehouseClient>,
    options: JobOptions,
}

impl Estimator {
    pub fn new(client: Arc<dyn WarehouseClient>, options: JobOptions) -> Self {
        Self { client, options }
    }

    pub fn set_location(&mut self, location: &str) {
        self.options.location = location.to_string();
    }

    /// Project used for two-part table names.
    pub fn default_project(&self) -> Option<String> {
        self.options
            .project
            .clone()
            .or_else(|| self.client.default_project().map(String::from))
    }

    /// Dry-runs `text` and returns an estimate bound to its fingerprint.
    ///
    /// Blank text fails with `EmptyQuery` without calling the warehouse.
    pub async fn estimate(&self, text: &str) -> Result<Estimate> {
        if text.trim().is_empty() {
            return Err(GuardError::EmptyQuery);
        }
        let fingerprint = Fingerprint::of(text);
        debug!(%fingerprint, "Starting dry run");

        let stats = self
            .client
            .dry_run(text, &self.options.for_mode(JobMode::DryRun))
            .await
            .map_err(|cause| {
                warn!(%fingerprint, error = %cause, "Dry run failed");
                GuardError::Estimation {
                    fingerprint: fingerprint.clone(),
                    cause,
                }
            })?;

        let referenced_tables = if stats.referenced_tables.is_empty() {
            policy::tables_in_sql(text, self.default_project().as_deref())
        } else {
            stats.referenced_tables
        };

        debug!(
            %fingerprint,
            bytes = ?stats.bytes_processed,
            tables = referenced_tables.len(),
            "Dry run complete"
        );

        Ok(Estimate {
            fingerprint,
            sql: text.to_string(),
            bytes_processed: stats.bytes_processed,
            row_estimate: stats.row_estimate,
            statement_type: stats.statement_type,
            referenced_tables,
            review: PolicyReport::default(),
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WarehouseError;
    use crate::warehouse::{FailingWarehouseClient, MockWarehouseClient};

    fn estimator(client: MockWarehouseClient) -> Estimator {
        Estimator::new(Arc::new(client), JobOptions::new(None, "US"))
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(1023), "1023B");
        assert_eq!(human_bytes(1024), "1.0KB");
        assert_eq!(human_bytes(1536), "1.5KB");
        assert_eq!(human_bytes(1_610_612_736), "1.5GB");
        assert_eq!(human_bytes(107_374_182_400), "100.0GB");
        assert_eq!(human_bytes(1_099_511_627_776), "1.0TB");
    }

    #[test]
    fn test_confirmation_phrase() {
        let estimate = Estimate {
            fingerprint: Fingerprint::of("SELECT 1"),
            sql: "SELECT 1".to_string(),
            bytes_processed: Some(1_610_612_736),
            row_estimate: None,
            statement_type: None,
            referenced_tables: vec![],
            review: PolicyReport::default(),
            created_at: Utc::now(),
        };
        assert_eq!(estimate.confirmation_phrase(), "RUN 1.5GB");
    }

    #[tokio::test]
    async fn test_estimate_binds_fingerprint_of_exact_text() {
        let client = MockWarehouseClient::new().with_bytes(2048).with_row_estimate(7);
        let estimate = estimator(client).estimate("SELECT 1 ").await.unwrap();
        assert_eq!(estimate.fingerprint, Fingerprint::of("SELECT 1 "));
        assert_eq!(estimate.sql, "SELECT 1 ");
        assert_eq!(estimate.bytes_processed, Some(2048));
        assert_eq!(estimate.row_estimate, Some(7));
    }

    #[tokio::test]
    async fn test_blank_text_never_reaches_warehouse() {
        let client = MockWarehouseClient::new();
        let err = estimator(client.clone()).estimate("  \n").await.unwrap_err();
        assert!(matches!(err, GuardError::EmptyQuery));
        assert_eq!(client.dry_run_calls(), 0);
    }

    #[tokio::test]
    async fn test_warehouse_failure_becomes_estimation_error() {
        let estimator = Estimator::new(
            Arc::new(FailingWarehouseClient),
            JobOptions::new(None, "US"),
        );
        let err = estimator.estimate("SELECT 1").await.unwrap_err();
        match err {
            GuardError::Estimation { fingerprint, cause } => {
                assert_eq!(fingerprint, Fingerprint::of("SELECT 1"));
                assert!(matches!(cause, WarehouseError::Network(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tables_fall_back_to_sql_text() {
        let client = MockWarehouseClient::new();
        let estimate = estimator(client)
            .estimate("SELECT a FROM sales.orders")
            .await
            .unwrap();
        assert_eq!(
            estimate.referenced_tables,
            vec![TableRef::new("mock-project", "sales", "orders")]
        );
    }
}
