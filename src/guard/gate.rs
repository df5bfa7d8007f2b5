//! The approval gate: estimate, review, confirm, then exactly one execution.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::{Estimate, Fingerprint, QueryBuffer};
use crate::error::{GuardError, Result};
use crate::policy::PolicyReport;

/// Where the gate currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatePhase {
    NoEstimate,
    Estimated,
    PendingConfirmation,
    Approved,
    Consumed,
    Invalidated,
}

impl fmt::Display for GatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatePhase::NoEstimate => "NoEstimate",
            GatePhase::Estimated => "Estimated",
            GatePhase::PendingConfirmation => "PendingConfirmation",
            GatePhase::Approved => "Approved",
            GatePhase::Consumed => "Consumed",
            GatePhase::Invalidated => "Invalidated",
        };
        write!(f, "{s}")
    }
}

/// Operator intents the gate reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    RequestEstimate,
    RequestConfirm,
    /// Carries the typed confirmation phrase.
    Confirm(String),
    Cancel,
    RequestExecute,
}

const FRESH: u8 = 0;
const IN_FLIGHT: u8 = 1;
const CONSUMED: u8 = 2;

#[derive(Debug)]
struct ApprovalInner {
    estimate: Estimate,
    revision: u64,
    approved_at: DateTime<Utc>,
    state: AtomicU8,
}

/// Single-use authorization to run exactly the text it was issued for.
///
/// Clones share their use state, so spending any clone spends them all.
#[derive(Debug, Clone)]
pub struct Approval {
    inner: Arc<ApprovalInner>,
}

impl Approval {
    fn new(estimate: Estimate, revision: u64) -> Self {
        Self {
            inner: Arc::new(ApprovalInner {
                estimate,
                revision,
                approved_at: Utc::now(),
                state: AtomicU8::new(FRESH),
            }),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.estimate.fingerprint
    }

    /// The estimate the operator confirmed.
    pub fn estimate(&self) -> &Estimate {
        &self.inner.estimate
    }

    pub fn approved_at(&self) -> DateTime<Utc> {
        self.inner.approved_at
    }

    pub(crate) fn revision(&self) -> u64 {
        self.inner.revision
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == CONSUMED
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == IN_FLIGHT
    }

    /// Unconsumed and issued for exactly this text.
    pub fn is_valid_for(&self, buffer: &QueryBuffer) -> bool {
        !self.is_consumed() && self.fingerprint().matches(buffer.text())
    }

    /// Claims the approval for one execution attempt.
    pub(crate) fn begin_use(&self) -> Result<()> {
        match self
            .inner
            .state
            .compare_exchange(FRESH, IN_FLIGHT, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(CONSUMED) => Err(GuardError::ApprovalAlreadyConsumed {
                fingerprint: self.fingerprint().clone(),
            }),
            Err(_) => Err(GuardError::ApprovalInUse {
                fingerprint: self.fingerprint().clone(),
            }),
        }
    }

    /// Marks the approval spent. Called once the submission call resolved.
    pub(crate) fn consume(&self) {
        self.inner.state.store(CONSUMED, Ordering::SeqCst);
    }

    /// Returns a claimed approval unused. Only valid before submission resolved.
    pub(crate) fn release(&self) {
        if let Err(state) = self.inner.state.compare_exchange(
            IN_FLIGHT,
            FRESH,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            debug!(fingerprint = %self.fingerprint(), state, "Release of an unclaimed approval ignored");
        }
    }
}

/// State machine guarding execution.
#[derive(Debug)]
pub struct ApprovalGate {
    phase: GatePhase,
    estimate: Option<Estimate>,
    estimate_revision: u64,
    approval: Option<Approval>,
    allow_warnings: bool,
}

impl ApprovalGate {
    pub fn new(allow_warnings: bool) -> Self {
        Self {
            phase: GatePhase::NoEstimate,
            estimate: None,
            estimate_revision: 0,
            approval: None,
            allow_warnings,
        }
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    pub fn estimate(&self) -> Option<&Estimate> {
        self.estimate.as_ref()
    }

    pub fn approval(&self) -> Option<&Approval> {
        self.approval.as_ref()
    }

    fn transition(&mut self, to: GatePhase) {
        if self.phase != to {
            debug!(from = %self.phase, to = %to, "Gate transition");
            self.phase = to;
        }
    }

    fn discard_approval(&mut self) {
        if self.approval.take().is_some() {
            self.transition(GatePhase::Invalidated);
        }
    }

    /// True when the held estimate was computed for the buffer's current revision.
    pub fn is_estimate_current(&self, buffer: &QueryBuffer) -> bool {
        self.estimate.is_some() && self.estimate_revision == buffer.revision()
    }

    /// True when an unconsumed approval exists for the buffer's current text.
    pub fn is_approved_for(&self, buffer: &QueryBuffer) -> bool {
        self.phase == GatePhase::Approved
            && self
                .approval
                .as_ref()
                .is_some_and(|a| a.revision() == buffer.revision() && !a.is_consumed())
    }

    /// Reconciles the gate with the buffer after an edit.
    ///
    /// Any approval for another revision is discarded; an open review for a
    /// stale estimate is closed.
    pub fn sync(&mut self, buffer: &QueryBuffer) {
        if self.estimate.is_none() || self.estimate_revision == buffer.revision() {
            return;
        }
        match self.phase {
            GatePhase::Approved => self.discard_approval(),
            GatePhase::PendingConfirmation => self.transition(GatePhase::Estimated),
            _ => {}
        }
    }

    /// A new estimate was requested. Any approval is discarded.
    pub fn request_estimate(&mut self) {
        match self.phase {
            GatePhase::Approved => self.discard_approval(),
            GatePhase::PendingConfirmation => self.transition(GatePhase::Estimated),
            _ => {}
        }
    }

    /// A requested estimate ended without a result (failed or cancelled).
    ///
    /// A gate left `Invalidated` by the request falls back to `Estimated` when
    /// the held estimate still matches the buffer, else to `NoEstimate`.
    pub fn estimate_abandoned(&mut self, buffer: &QueryBuffer) {
        if self.phase != GatePhase::Invalidated {
            return;
        }
        if self.is_estimate_current(buffer) {
            self.transition(GatePhase::Estimated);
        } else {
            self.transition(GatePhase::NoEstimate);
        }
    }

    pub fn set_allow_warnings(&mut self, allow_warnings: bool) {
        self.allow_warnings = allow_warnings;
    }

    /// Swaps the policy review of the held estimate after the rules changed.
    ///
    /// Drops any approval and closes an open review.
    pub fn replace_review(&mut self, review: PolicyReport, allow_warnings: bool) {
        self.allow_warnings = allow_warnings;
        let Some(estimate) = self.estimate.take() else {
            return;
        };
        self.estimate = Some(estimate.with_review(review));
        self.approval = None;
        if matches!(
            self.phase,
            GatePhase::Approved | GatePhase::PendingConfirmation
        ) {
            self.transition(GatePhase::Estimated);
        }
    }

    /// Stores a fresh estimate for `revision`.
    pub fn accept_estimate(&mut self, estimate: Estimate, revision: u64) {
        self.approval = None;
        self.estimate = Some(estimate);
        self.estimate_revision = revision;
        self.transition(GatePhase::Estimated);
    }

    /// Opens the review for the current estimate.
    pub fn request_confirm(&mut self, buffer: &QueryBuffer) -> Result<&Estimate> {
        let Some(estimate) = &self.estimate else {
            return Err(GuardError::NoEstimate);
        };
        if self.estimate_revision != buffer.revision() {
            return Err(GuardError::StaleEstimate {
                estimated: estimate.fingerprint.clone(),
            });
        }
        match self.phase {
            GatePhase::Estimated | GatePhase::PendingConfirmation => {
                self.transition(GatePhase::PendingConfirmation);
            }
            GatePhase::Approved => {}
            GatePhase::NoEstimate => return Err(GuardError::NoEstimate),
            GatePhase::Consumed | GatePhase::Invalidated => {
                return Err(GuardError::StaleEstimate {
                    estimated: estimate.fingerprint.clone(),
                });
            }
        }
        self.estimate.as_ref().ok_or(GuardError::NoEstimate)
    }

    /// Confirms the open review and issues an approval.
    ///
    /// Fails, leaving the review open, when the phrase is wrong or policy
    /// findings forbid approval.
    pub fn confirm(&mut self, buffer: &QueryBuffer, typed: &str) -> Result<Approval> {
        match self.phase {
            GatePhase::PendingConfirmation => {}
            GatePhase::NoEstimate => return Err(GuardError::NoEstimate),
            phase => return Err(GuardError::NotInReview { phase }),
        }
        let Some(estimate) = &self.estimate else {
            return Err(GuardError::NoEstimate);
        };
        if self.estimate_revision != buffer.revision() {
            let estimated = estimate.fingerprint.clone();
            self.transition(GatePhase::Estimated);
            return Err(GuardError::StaleEstimate { estimated });
        }

        let codes = estimate.review.blocking_codes(self.allow_warnings);
        if !codes.is_empty() {
            return Err(GuardError::PolicyBlocked { codes });
        }

        let expected = estimate.confirmation_phrase();
        if typed.trim() != expected {
            return Err(GuardError::ConfirmationMismatch { expected });
        }

        let approval = Approval::new(estimate.clone(), self.estimate_revision);
        self.approval = Some(approval.clone());
        self.transition(GatePhase::Approved);
        Ok(approval)
    }

    /// Closes an open review without approving.
    pub fn cancel(&mut self) {
        if self.phase == GatePhase::PendingConfirmation {
            self.transition(GatePhase::Estimated);
        }
    }

    /// The live approval, for handing to the executor.
    pub fn approval_for_execution(&self) -> Result<Approval> {
        match (&self.approval, self.phase) {
            (Some(approval), GatePhase::Approved) => Ok(approval.clone()),
            (_, phase) => Err(GuardError::NotApproved { phase }),
        }
    }

    /// Records the outcome of an execution attempt with `approval`.
    pub fn finish_execution(&mut self, approval: &Approval) {
        let same = self
            .approval
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(&held.inner, &approval.inner));
        if same && approval.is_consumed() {
            self.approval = None;
            self.transition(GatePhase::Consumed);
        }
    }

    /// Drops any approval, e.g. after the executor saw the text diverge.
    pub fn invalidate(&mut self) {
        self.discard_approval();
    }

    /// Applies the intents that need no collaborator call.
    ///
    /// `RequestEstimate` only discards approvals here; the session performs
    /// the dry run. `RequestExecute` only checks that an approval is live.
    pub fn apply(&mut self, intent: &Intent, buffer: &QueryBuffer) -> Result<GatePhase> {
        match intent {
            Intent::RequestEstimate => self.request_estimate(),
            Intent::RequestConfirm => {
                self.request_confirm(buffer)?;
            }
            Intent::Confirm(typed) => {
                self.confirm(buffer, typed)?;
            }
            Intent::Cancel => self.cancel(),
            Intent::RequestExecute => {
                self.approval_for_execution()?;
            }
        }
        Ok(self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Finding, FindingCode, Severity};

    fn estimate_for(buffer: &QueryBuffer, bytes: u64) -> Estimate {
        Estimate {
            fingerprint: buffer.fingerprint(),
            sql: buffer.text().to_string(),
            bytes_processed: Some(bytes),
            row_estimate: None,
            statement_type: Some("SELECT".to_string()),
            referenced_tables: vec![],
            review: PolicyReport::default(),
            created_at: Utc::now(),
        }
    }

    fn estimated_gate(buffer: &QueryBuffer) -> ApprovalGate {
        let mut gate = ApprovalGate::new(true);
        gate.accept_estimate(estimate_for(buffer, 512), buffer.revision());
        gate
    }

    fn approved_gate(buffer: &QueryBuffer) -> (ApprovalGate, Approval) {
        let mut gate = estimated_gate(buffer);
        gate.request_confirm(buffer).unwrap();
        let approval = gate.confirm(buffer, "RUN 512B").unwrap();
        (gate, approval)
    }

    #[test]
    fn test_starts_without_estimate() {
        let gate = ApprovalGate::new(true);
        assert_eq!(gate.phase(), GatePhase::NoEstimate);
        assert!(gate.estimate().is_none());
    }

    #[test]
    fn test_confirm_without_estimate_fails() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = ApprovalGate::new(true);
        assert!(matches!(
            gate.request_confirm(&buffer),
            Err(GuardError::NoEstimate)
        ));
        assert!(matches!(
            gate.confirm(&buffer, "RUN 0B"),
            Err(GuardError::NoEstimate)
        ));
        assert_eq!(gate.phase(), GatePhase::NoEstimate);
    }

    #[test]
    fn test_full_cycle_issues_approval() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (gate, approval) = approved_gate(&buffer);
        assert_eq!(gate.phase(), GatePhase::Approved);
        assert_eq!(approval.fingerprint(), &buffer.fingerprint());
        assert!(approval.is_valid_for(&buffer));
        assert!(gate.is_approved_for(&buffer));
    }

    #[test]
    fn test_confirm_requires_open_review() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = estimated_gate(&buffer);
        assert!(matches!(
            gate.confirm(&buffer, "RUN 512B"),
            Err(GuardError::NotInReview {
                phase: GatePhase::Estimated
            })
        ));
    }

    #[test]
    fn test_wrong_phrase_keeps_review_open() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = estimated_gate(&buffer);
        gate.request_confirm(&buffer).unwrap();
        let err = gate.confirm(&buffer, "RUN 1KB").unwrap_err();
        assert!(matches!(err, GuardError::ConfirmationMismatch { ref expected } if expected == "RUN 512B"));
        assert_eq!(gate.phase(), GatePhase::PendingConfirmation);
    }

    #[test]
    fn test_cancel_returns_to_estimated() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = estimated_gate(&buffer);
        gate.request_confirm(&buffer).unwrap();
        gate.cancel();
        assert_eq!(gate.phase(), GatePhase::Estimated);
        assert!(gate.approval().is_none());
    }

    #[test]
    fn test_edit_invalidates_approval() {
        let mut buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, approval) = approved_gate(&buffer);
        buffer.insert_char(8, ' ');
        gate.sync(&buffer);
        assert_eq!(gate.phase(), GatePhase::Invalidated);
        assert!(gate.approval().is_none());
        assert!(!gate.is_approved_for(&buffer));
        assert!(!approval.is_valid_for(&buffer));
    }

    #[test]
    fn test_edit_closes_stale_review() {
        let mut buffer = QueryBuffer::new("SELECT 1");
        let mut gate = estimated_gate(&buffer);
        gate.request_confirm(&buffer).unwrap();
        buffer.set_text("SELECT 2");
        gate.sync(&buffer);
        assert_eq!(gate.phase(), GatePhase::Estimated);
        assert!(matches!(
            gate.request_confirm(&buffer),
            Err(GuardError::StaleEstimate { .. })
        ));
    }

    #[test]
    fn test_new_estimate_request_discards_approval() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, _) = approved_gate(&buffer);
        gate.apply(&Intent::RequestEstimate, &buffer).unwrap();
        assert_eq!(gate.phase(), GatePhase::Invalidated);
        assert!(matches!(
            gate.approval_for_execution(),
            Err(GuardError::NotApproved {
                phase: GatePhase::Invalidated
            })
        ));
    }

    #[test]
    fn test_abandoned_estimate_falls_back_to_held_estimate() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, approval) = approved_gate(&buffer);
        gate.request_estimate();
        assert_eq!(gate.phase(), GatePhase::Invalidated);

        gate.estimate_abandoned(&buffer);
        assert_eq!(gate.phase(), GatePhase::Estimated);
        assert!(gate.approval().is_none());
        assert!(!approval.is_consumed());
        assert!(gate.request_confirm(&buffer).is_ok());
    }

    #[test]
    fn test_abandoned_estimate_for_edited_text_has_no_estimate() {
        let mut buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, _) = approved_gate(&buffer);
        buffer.set_text("SELECT 2");
        gate.sync(&buffer);
        assert_eq!(gate.phase(), GatePhase::Invalidated);

        gate.estimate_abandoned(&buffer);
        assert_eq!(gate.phase(), GatePhase::NoEstimate);
    }

    #[test]
    fn test_abandoned_estimate_leaves_other_phases() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, approval) = approved_gate(&buffer);
        approval.begin_use().unwrap();
        approval.consume();
        gate.finish_execution(&approval);

        gate.estimate_abandoned(&buffer);
        assert_eq!(gate.phase(), GatePhase::Consumed);
    }

    #[test]
    fn test_replaced_review_drops_approval() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, approval) = approved_gate(&buffer);
        let report = PolicyReport {
            findings: vec![Finding::new(Severity::Error, FindingCode::BytesBlock, "too big")],
            partition_summary: vec![],
        };

        gate.replace_review(report, true);
        assert_eq!(gate.phase(), GatePhase::Estimated);
        assert!(gate.approval().is_none());
        assert!(!gate.is_approved_for(&buffer));
        assert!(!approval.is_consumed());
        assert_eq!(gate.estimate().unwrap().review.findings.len(), 1);

        gate.request_confirm(&buffer).unwrap();
        assert!(matches!(
            gate.confirm(&buffer, "RUN 512B"),
            Err(GuardError::PolicyBlocked { ref codes }) if codes == &["BYTES_BLOCK"]
        ));
    }

    #[test]
    fn test_replaced_review_applies_warning_rule() {
        let buffer = QueryBuffer::new("SELECT * FROM t");
        let mut gate = estimated_gate(&buffer);
        let report = PolicyReport {
            findings: vec![Finding::new(Severity::Warn, FindingCode::SelectStar, "star")],
            partition_summary: vec![],
        };

        gate.replace_review(report, false);
        gate.request_confirm(&buffer).unwrap();
        assert!(matches!(
            gate.confirm(&buffer, "RUN 512B"),
            Err(GuardError::PolicyBlocked { .. })
        ));
    }

    #[test]
    fn test_policy_errors_block_confirmation() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = ApprovalGate::new(true);
        let estimate = estimate_for(&buffer, 512).with_review(PolicyReport {
            findings: vec![Finding::new(
                Severity::Error,
                FindingCode::PartitionMissing,
                "needs filter",
            )],
            partition_summary: vec![],
        });
        gate.accept_estimate(estimate, buffer.revision());
        gate.request_confirm(&buffer).unwrap();
        let err = gate.confirm(&buffer, "RUN 512B").unwrap_err();
        assert!(matches!(err, GuardError::PolicyBlocked { ref codes } if codes == &["PARTITION_MISSING"]));
        assert_eq!(gate.phase(), GatePhase::PendingConfirmation);
    }

    #[test]
    fn test_warnings_block_only_when_disallowed() {
        let buffer = QueryBuffer::new("SELECT * FROM t");
        let report = PolicyReport {
            findings: vec![Finding::new(Severity::Warn, FindingCode::SelectStar, "star")],
            partition_summary: vec![],
        };

        let mut lenient = ApprovalGate::new(true);
        lenient.accept_estimate(estimate_for(&buffer, 10).with_review(report.clone()), 0);
        lenient.request_confirm(&buffer).unwrap();
        assert!(lenient.confirm(&buffer, "RUN 10B").is_ok());

        let mut strict = ApprovalGate::new(false);
        strict.accept_estimate(estimate_for(&buffer, 10).with_review(report), 0);
        strict.request_confirm(&buffer).unwrap();
        assert!(matches!(
            strict.confirm(&buffer, "RUN 10B"),
            Err(GuardError::PolicyBlocked { .. })
        ));
    }

    #[test]
    fn test_approval_is_single_use() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, approval) = approved_gate(&buffer);

        approval.begin_use().unwrap();
        assert!(approval.is_in_flight());
        assert!(matches!(
            approval.clone().begin_use(),
            Err(GuardError::ApprovalInUse { .. })
        ));
        approval.consume();
        assert!(matches!(
            approval.begin_use(),
            Err(GuardError::ApprovalAlreadyConsumed { .. })
        ));

        gate.finish_execution(&approval);
        assert_eq!(gate.phase(), GatePhase::Consumed);
        assert!(gate.approval().is_none());
        assert!(matches!(
            gate.request_confirm(&buffer),
            Err(GuardError::StaleEstimate { .. })
        ));
    }

    #[test]
    fn test_released_approval_stays_live() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (mut gate, approval) = approved_gate(&buffer);
        approval.begin_use().unwrap();
        approval.release();
        gate.finish_execution(&approval);
        assert_eq!(gate.phase(), GatePhase::Approved);
        assert!(approval.begin_use().is_ok());
    }

    #[test]
    fn test_release_leaves_unclaimed_states() {
        let buffer = QueryBuffer::new("SELECT 1");
        let (_gate, approval) = approved_gate(&buffer);
        approval.release();
        assert!(!approval.is_in_flight());
        assert!(!approval.is_consumed());

        approval.begin_use().unwrap();
        approval.consume();
        approval.release();
        assert!(approval.is_consumed());
    }

    #[test]
    fn test_request_execute_without_approval() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = estimated_gate(&buffer);
        assert!(matches!(
            gate.apply(&Intent::RequestExecute, &buffer),
            Err(GuardError::NotApproved {
                phase: GatePhase::Estimated
            })
        ));
    }

    #[test]
    fn test_apply_walks_the_happy_path() {
        let buffer = QueryBuffer::new("SELECT 1");
        let mut gate = estimated_gate(&buffer);
        assert_eq!(
            gate.apply(&Intent::RequestConfirm, &buffer).unwrap(),
            GatePhase::PendingConfirmation
        );
        assert_eq!(
            gate.apply(&Intent::Confirm("RUN 512B".into()), &buffer)
                .unwrap(),
            GatePhase::Approved
        );
        assert_eq!(
            gate.apply(&Intent::RequestExecute, &buffer).unwrap(),
            GatePhase::Approved
        );
    }
}
