//! Error types for bq-guard.
//!
//! `GuardError` is the workflow-level error surfaced to the operator.
//! `WarehouseError` is what the warehouse client reports; it is wrapped by the
//! workflow variants so the operator always sees which query it concerned.

use thiserror::Error;

use crate::guard::{Fingerprint, GatePhase, Operation};
use crate::warehouse::TableRef;

/// Failure reported by a warehouse client call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    /// Transport failure (DNS, TLS, connection reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// Missing or rejected credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The service answered with an error status.
    #[error("warehouse rejected the request ({status}): {message}")]
    Api { status: u16, message: String },

    /// The service answered with something we could not interpret.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    /// The call was abandoned before it resolved.
    #[error("request cancelled")]
    Cancelled,
}

impl WarehouseError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}

/// Main error type for the guarded workflow.
#[derive(Error, Debug)]
pub enum GuardError {
    /// The buffer is empty or whitespace only.
    #[error("Query is empty; nothing to estimate")]
    EmptyQuery,

    /// The dry-run call failed.
    #[error("Estimation failed for {fingerprint}: {cause}")]
    Estimation {
        fingerprint: Fingerprint,
        #[source]
        cause: WarehouseError,
    },

    /// Confirmation was requested before any estimate existed.
    #[error("No estimate yet; run an estimate before reviewing")]
    NoEstimate,

    /// The estimate on hand was computed for an earlier revision of the buffer.
    #[error("Estimate {estimated} no longer matches the query; estimate again")]
    StaleEstimate { estimated: Fingerprint },

    /// A confirmation was typed while no review was open.
    #[error("No review is open (gate is {phase}); open a review first")]
    NotInReview { phase: GatePhase },

    /// The typed confirmation phrase did not match.
    #[error("Confirmation does not match; type `{expected}` exactly")]
    ConfirmationMismatch { expected: String },

    /// Review findings forbid approval.
    #[error("Approval blocked by policy: {}", .codes.join(", "))]
    PolicyBlocked { codes: Vec<String> },

    /// Execution was requested without a live approval.
    #[error("Not approved (gate is {phase}); review and confirm first")]
    NotApproved { phase: GatePhase },

    /// The approval was already spent by an earlier execution attempt.
    #[error("Approval for {fingerprint} was already used; review again")]
    ApprovalAlreadyConsumed { fingerprint: Fingerprint },

    /// Another execution currently holds this approval.
    #[error("Approval for {fingerprint} is held by a running execution")]
    ApprovalInUse { fingerprint: Fingerprint },

    /// The query text changed between approval and execution.
    #[error("Query changed after approval (approved {approved}, now {current}); review again")]
    QueryDiverged {
        approved: Fingerprint,
        current: Fingerprint,
    },

    /// The submitted job failed, or failed while producing rows.
    #[error("Execution failed for {fingerprint}: {cause}")]
    Execution {
        fingerprint: Fingerprint,
        #[source]
        cause: WarehouseError,
    },

    /// Table metadata could not be fetched.
    #[error("Metadata fetch failed for {table}: {cause}")]
    MetadataFetch {
        table: TableRef,
        #[source]
        cause: WarehouseError,
    },

    /// Writing rows to the sink failed partway.
    #[error("Export failed after {rows_written} rows: {cause}")]
    Export { rows_written: u64, cause: String },

    /// An operation of the same kind is already running.
    #[error("{operation} already in progress")]
    Busy { operation: Operation },

    /// The operator cancelled the operation before it resolved.
    #[error("{operation} cancelled")]
    Cancelled { operation: Operation },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local state database failures.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Unexpected states (terminal I/O, bugs).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn export(rows_written: u64, cause: impl ToString) -> Self {
        Self::Export {
            rows_written,
            cause: cause.to_string(),
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::EmptyQuery => "Empty Query",
            Self::Estimation { .. } => "Estimation Error",
            Self::NoEstimate | Self::StaleEstimate { .. } => "Estimate Required",
            Self::NotInReview { .. }
            | Self::ConfirmationMismatch { .. }
            | Self::PolicyBlocked { .. } => "Review Error",
            Self::NotApproved { .. }
            | Self::ApprovalAlreadyConsumed { .. }
            | Self::ApprovalInUse { .. }
            | Self::QueryDiverged { .. } => "Approval Error",
            Self::Execution { .. } => "Execution Error",
            Self::MetadataFetch { .. } => "Metadata Error",
            Self::Export { .. } => "Export Error",
            Self::Busy { .. } | Self::Cancelled { .. } => "Operation",
            Self::Config(_) => "Configuration Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true when the approval protocol refused to run the query.
    ///
    /// None of these variants ever reach the warehouse.
    pub fn is_guard_refusal(&self) -> bool {
        matches!(
            self,
            Self::EmptyQuery
                | Self::NoEstimate
                | Self::StaleEstimate { .. }
                | Self::NotInReview { .. }
                | Self::ConfirmationMismatch { .. }
                | Self::PolicyBlocked { .. }
                | Self::NotApproved { .. }
                | Self::ApprovalAlreadyConsumed { .. }
                | Self::ApprovalInUse { .. }
                | Self::QueryDiverged { .. }
        )
    }
}

impl From<sqlx::Error> for GuardError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Result type alias using GuardError.
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_display() {
        let err = GuardError::EmptyQuery;
        assert_eq!(err.to_string(), "Query is empty; nothing to estimate");
        assert_eq!(err.category(), "Empty Query");
        assert!(err.is_guard_refusal());
    }

    #[test]
    fn test_estimation_error_carries_fingerprint_and_cause() {
        let fingerprint = Fingerprint::of("SELECT 1");
        let err = GuardError::Estimation {
            fingerprint: fingerprint.clone(),
            cause: WarehouseError::network("connection reset"),
        };
        let msg = err.to_string();
        assert!(msg.contains(fingerprint.short()));
        assert!(msg.contains("network error: connection reset"));
        assert_eq!(err.category(), "Estimation Error");
        assert!(!err.is_guard_refusal());
    }

    #[test]
    fn test_query_diverged_names_both_fingerprints() {
        let approved = Fingerprint::of("SELECT 1");
        let current = Fingerprint::of("SELECT 2");
        let err = GuardError::QueryDiverged {
            approved: approved.clone(),
            current: current.clone(),
        };
        let msg = err.to_string();
        assert!(msg.contains(approved.short()));
        assert!(msg.contains(current.short()));
        assert_eq!(err.category(), "Approval Error");
    }

    #[test]
    fn test_policy_blocked_lists_codes() {
        let err = GuardError::PolicyBlocked {
            codes: vec!["BYTES_BLOCK".to_string(), "SELECT_STAR".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Approval blocked by policy: BYTES_BLOCK, SELECT_STAR"
        );
    }

    #[test]
    fn test_not_approved_shows_phase() {
        let err = GuardError::NotApproved {
            phase: GatePhase::Estimated,
        };
        assert_eq!(
            err.to_string(),
            "Not approved (gate is Estimated); review and confirm first"
        );
    }

    #[test]
    fn test_busy_and_cancelled_display() {
        let err = GuardError::Busy {
            operation: Operation::Execute,
        };
        assert_eq!(err.to_string(), "Execution already in progress");
        let err = GuardError::Cancelled {
            operation: Operation::Estimate,
        };
        assert_eq!(err.to_string(), "Estimate cancelled");
    }

    #[test]
    fn test_export_error_reports_progress() {
        let err = GuardError::export(42, "disk full");
        assert_eq!(err.to_string(), "Export failed after 42 rows: disk full");
        assert_eq!(err.category(), "Export Error");
    }

    #[test]
    fn test_warehouse_error_display() {
        assert_eq!(
            WarehouseError::api(403, "Access Denied").to_string(),
            "warehouse rejected the request (403): Access Denied"
        );
        assert_eq!(WarehouseError::Cancelled.to_string(), "request cancelled");
    }

    #[test]
    fn test_error_source_is_warehouse_error() {
        use std::error::Error as _;
        let err = GuardError::Execution {
            fingerprint: Fingerprint::of("SELECT 1"),
            cause: WarehouseError::api(400, "quota exceeded"),
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("warehouse rejected the request (400): quota exceeded")
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GuardError>();
        assert_send_sync::<WarehouseError>();
    }
}
