//! The guarded execution workflow.
//!
//! Approve what you estimated, run what you approved: an [`Estimate`] is bound
//! to the fingerprint of the exact text that was dry-run, the [`ApprovalGate`]
//! turns an explicitly confirmed estimate into a single-use [`Approval`], and
//! the [`Executor`] refuses to submit anything whose fingerprint differs.

mod buffer;
mod estimate;
mod executor;
mod fingerprint;
mod gate;
mod session;

pub use buffer::QueryBuffer;
pub use estimate::{human_bytes, Estimate, Estimator};
pub use executor::{ExecutionResult, Executor};
pub use fingerprint::Fingerprint;
pub use gate::{Approval, ApprovalGate, GatePhase, Intent};
pub use session::{
    EstimateJob, EstimateOutcome, ExecuteJob, ExecuteOutcome, ExportJob, ExportOutcome,
    GuardSession, IntentOutcome, ResultPreview,
};

use std::fmt;

use serde::Serialize;

/// Long-running operations the session runs one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Estimate,
    Execute,
    Export,
    MetadataRefresh,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Estimate => "Estimate",
            Operation::Execute => "Execution",
            Operation::Export => "Export",
            Operation::MetadataRefresh => "Metadata refresh",
        };
        write!(f, "{s}")
    }
}
