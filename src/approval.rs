//! Approval workflow for expenses at or above a group's threshold.
//!
//! Requests are keyed by expense id and move pending -> approved or
//! pending -> rejected exactly once. Only managers and admins may decide;
//! rejections carry a reason. The session layer turns decisions into
//! mutation events and activity entries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::types::{ApprovalRequest, ApprovalStatus, Expense, Group, MemberRole};

/// Outcome a reviewer picks for a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    fn status(self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        }
    }
}

#[derive(Default)]
pub struct ApprovalWorkflow {
    requests: HashMap<String, ApprovalRequest>,
}

impl ApprovalWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an expense needs approval under its group's settings.
    pub fn required_for(expense: &Expense, group: &Group) -> bool {
        expense.amount >= group.require_approval_threshold
    }

    /// Create a pending request if the expense meets the group threshold.
    ///
    /// Below the threshold no request is created and `Ok(None)` is
    /// returned: the expense carries no approval status at all. Submitting
    /// again while a request is still pending returns the existing request
    /// unchanged; submitting after a decision is a state error.
    pub fn submit(&mut self, expense: &Expense, group: &Group) -> Result<Option<ApprovalRequest>> {
        if !Self::required_for(expense, group) {
            debug!(
                expense_id = %expense.id,
                amount = expense.amount,
                threshold = group.require_approval_threshold,
                "Expense below approval threshold"
            );
            return Ok(None);
        }

        if let Some(existing) = self.requests.get(&expense.id) {
            if existing.status.is_terminal() {
                return Err(SyncError::State(format!(
                    "expense {} was already {}",
                    expense.id, existing.status
                )));
            }
            return Ok(Some(existing.clone()));
        }

        let request = ApprovalRequest::new(&expense.id, &expense.paid_by).with_group(&group.id);
        info!(
            expense_id = %expense.id,
            group_id = %group.id,
            amount = expense.amount,
            "Approval requested"
        );
        self.requests.insert(expense.id.clone(), request.clone());
        Ok(Some(request))
    }

    /// Decide a pending request. The caller resolves the reviewer's role
    /// from group membership before calling.
    pub fn decide(
        &mut self,
        expense_id: &str,
        decision: ApprovalDecision,
        reviewer_id: &str,
        reviewer_role: MemberRole,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest> {
        if !reviewer_role.can_decide_approvals() {
            return Err(SyncError::Authorization(format!(
                "role {} cannot decide approvals",
                reviewer_role
            )));
        }

        let request = self.requests.get_mut(expense_id).ok_or_else(|| {
            SyncError::State(format!("no approval request for expense {}", expense_id))
        })?;
        if request.status.is_terminal() {
            return Err(SyncError::State(format!(
                "expense {} was already {}",
                expense_id, request.status
            )));
        }

        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if decision == ApprovalDecision::Reject && reason.is_none() {
            return Err(SyncError::Validation(
                "a rejection requires a reason".into(),
            ));
        }

        request.status = decision.status();
        request.reviewed_by = Some(reviewer_id.to_string());
        request.reviewed_at = Some(Utc::now());
        request.reason = reason.map(str::to_string);
        info!(
            expense_id,
            reviewer_id,
            status = %request.status,
            "Approval decided"
        );
        Ok(request.clone())
    }

    /// Mirror the approval state carried by an accepted remote expense
    /// mutation, so a reviewer on this side can decide a request that
    /// originated elsewhere.
    ///
    /// Pending seeds a request if none exists; a terminal status closes a
    /// pending request or records an already-decided one. Anything that
    /// would move a request backwards is ignored.
    pub fn note_remote(
        &mut self,
        expense_id: &str,
        status: ApprovalStatus,
        actor: &str,
        group_id: Option<&str>,
        at: DateTime<Utc>,
    ) {
        match self.requests.get_mut(expense_id) {
            None => {
                let mut request = ApprovalRequest::new(expense_id, actor);
                request.status = status;
                request.group_id = group_id.map(str::to_string);
                request.requested_at = at;
                if status.is_terminal() {
                    request.reviewed_by = Some(actor.to_string());
                    request.reviewed_at = Some(at);
                }
                debug!(expense_id, %status, "Noted remote approval state");
                self.requests.insert(expense_id.to_string(), request);
            }
            Some(existing) if !existing.status.is_terminal() && status.is_terminal() => {
                existing.status = status;
                existing.reviewed_by = Some(actor.to_string());
                existing.reviewed_at = Some(at);
                debug!(expense_id, %status, reviewer = actor, "Remote decision applied");
            }
            Some(_) => {}
        }
    }

    pub fn request(&self, expense_id: &str) -> Option<&ApprovalRequest> {
        self.requests.get(expense_id)
    }

    pub fn pending(&self) -> Vec<&ApprovalRequest> {
        let mut pending: Vec<&ApprovalRequest> = self
            .requests
            .values()
            .filter(|request| request.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Snapshot support.
    pub fn export_requests(&self) -> Vec<ApprovalRequest> {
        self.requests.values().cloned().collect()
    }

    pub fn restore_requests(&mut self, requests: Vec<ApprovalRequest>) {
        for request in requests {
            self.requests.insert(request.expense_id.clone(), request);
        }
    }
}
