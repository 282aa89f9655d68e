//! Core domain types shared across the sync engine.
//!
//! Everything that crosses the wire serializes with camelCase field names
//! and snake_case enum values, matching the collaboration server's JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The authenticated actor a session runs as. Supplied by the identity
/// provider at session construction and treated as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: MemberRole,
}

impl UserIdentity {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

/// Role of a group member. Ordered so that authorization checks can
/// compare against the minimum required role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
#[derive(Default)]
pub enum MemberRole {
    #[default]
    Member = 0,
    Manager = 1,
    Admin = 2,
}

impl MemberRole {
    /// Approval decisions require at least manager role.
    pub fn can_decide_approvals(self) -> bool {
        self >= MemberRole::Manager
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Member => write!(f, "member"),
            MemberRole::Manager => write!(f, "manager"),
            MemberRole::Admin => write!(f, "admin"),
        }
    }
}

/// Membership lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum MemberStatus {
    #[default]
    Active,
    Pending,
    Inactive,
}

/// A member of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub user_id: String,
    /// Optional friendly name, used when rendering presence for this user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: MemberRole,
    pub status: MemberStatus,
}

impl GroupMember {
    pub fn new(user_id: impl Into<String>, role: MemberRole) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            role,
            status: MemberStatus::Active,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Active admins are the ones that count for the last-admin invariant.
    pub fn is_active_admin(&self) -> bool {
        self.role == MemberRole::Admin && self.status == MemberStatus::Active
    }
}

/// A shared expense group with its approval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Expenses at or above this amount require approval
    pub require_approval_threshold: f64,
    pub members: Vec<GroupMember>,
}

impl Group {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        require_approval_threshold: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            require_approval_threshold,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: GroupMember) -> Self {
        self.members.push(member);
        self
    }

    pub fn member(&self, user_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn active_admin_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_active_admin()).count()
    }
}

/// What a collaborator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum PresenceStatus {
    #[default]
    Viewing,
    Editing,
    Away,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Viewing => write!(f, "viewing"),
            PresenceStatus::Editing => write!(f, "editing"),
            PresenceStatus::Away => write!(f, "away"),
        }
    }
}

/// One collaborator's presence, keyed by user id in the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    /// Group the presence is scoped to; absent means personal scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// Entity the user is currently editing, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editing_entity_id: Option<String>,
}

impl PresenceRecord {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        status: PresenceStatus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            status,
            scope: None,
            last_seen: Utc::now(),
            editing_entity_id: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_editing(mut self, entity_id: impl Into<String>) -> Self {
        self.editing_entity_id = Some(entity_id.into());
        self
    }
}

/// Kind of entity a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Expense,
    Group,
    Member,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Expense => write!(f, "expense"),
            EntityKind::Group => write!(f, "group"),
            EntityKind::Member => write!(f, "member"),
        }
    }
}

/// Mutation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOp::Create => write!(f, "create"),
            MutationOp::Update => write!(f, "update"),
            MutationOp::Delete => write!(f, "delete"),
        }
    }
}

/// The unit of broadcast and reconciliation. Immutable once created; the
/// id is a fresh UUID per origin so redelivered copies are detectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub id: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub op: MutationOp,
    pub data: serde_json::Value,
    pub origin_user_id: String,
    pub origin_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl MutationEvent {
    pub fn new(
        op: MutationOp,
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        data: serde_json::Value,
        origin_user_id: impl Into<String>,
        group_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            op,
            data,
            origin_user_id: origin_user_id.into(),
            origin_timestamp: Utc::now(),
            group_id,
        }
    }

    /// Minimum shape required before an event may enter reconciliation.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.entity_id.is_empty() && !self.origin_user_id.is_empty()
    }
}

/// Kind of activity feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ExpenseCreated,
    ExpenseUpdated,
    ExpenseDeleted,
    ExpenseApproved,
    ExpenseRejected,
    MemberJoined,
    MemberLeft,
    MemberRoleChanged,
}

/// One row of the activity feed. Derived from accepted mutations and
/// membership events; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub entity_id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        kind: ActivityKind,
        user_id: impl Into<String>,
        entity_id: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            user_id: user_id.into(),
            group_id: None,
            entity_id: entity_id.into(),
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Derive the feed entry for an accepted mutation.
    pub fn from_mutation(event: &MutationEvent) -> Self {
        let kind = match (event.entity_type, event.op) {
            (EntityKind::Expense, MutationOp::Create) => ActivityKind::ExpenseCreated,
            (EntityKind::Expense, MutationOp::Update) => ActivityKind::ExpenseUpdated,
            (EntityKind::Expense, MutationOp::Delete) => ActivityKind::ExpenseDeleted,
            (EntityKind::Member, MutationOp::Create) => ActivityKind::MemberJoined,
            (EntityKind::Member, MutationOp::Delete) => ActivityKind::MemberLeft,
            (EntityKind::Member, MutationOp::Update) => ActivityKind::MemberRoleChanged,
            // Group entities only flow through as updates today
            (EntityKind::Group, _) => ActivityKind::ExpenseUpdated,
        };
        let summary = format!(
            "{} {}d {} {}",
            event.origin_user_id, event.op, event.entity_type, event.entity_id
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            user_id: event.origin_user_id.clone(),
            group_id: event.group_id.clone(),
            entity_id: event.entity_id.clone(),
            summary,
            created_at: event.origin_timestamp,
        }
    }
}

/// Approval state of a gated expense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Rejected)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// An approval request for an expense at or above its group threshold.
/// Keyed by expense id; terminal once approved or rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub expense_id: String,
    pub status: ApprovalStatus,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalRequest {
    pub fn new(expense_id: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            expense_id: expense_id.into(),
            status: ApprovalStatus::Pending,
            requested_by: requested_by.into(),
            group_id: None,
            requested_at: Utc::now(),
            reviewed_by: None,
            reviewed_at: None,
            reason: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// An expense as the sync core sees it. Rendering, receipts and currency
/// formatting live with the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub description: String,
    pub amount: f64,
    pub paid_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    pub created_at: DateTime<Utc>,
}

impl Expense {
    pub fn new(description: impl Into<String>, amount: f64, paid_by: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            amount,
            paid_by: paid_by.into(),
            group_id: None,
            approval_status: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(MemberRole::Admin > MemberRole::Manager);
        assert!(MemberRole::Manager > MemberRole::Member);
        assert!(MemberRole::Manager.can_decide_approvals());
        assert!(!MemberRole::Member.can_decide_approvals());
    }

    #[test]
    fn test_mutation_event_wire_names() {
        let event = MutationEvent::new(
            MutationOp::Update,
            EntityKind::Expense,
            "exp-1",
            serde_json::json!({"amount": 12.5}),
            "user-1",
            Some("grp-1".to_string()),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["entityType"], "expense");
        assert_eq!(value["op"], "update");
        assert_eq!(value["originUserId"], "user-1");
        assert_eq!(value["groupId"], "grp-1");
        assert!(value["originTimestamp"].is_string());
    }

    #[test]
    fn test_activity_from_mutation() {
        let event = MutationEvent::new(
            MutationOp::Create,
            EntityKind::Expense,
            "exp-2",
            serde_json::json!({}),
            "user-9",
            None,
        );
        let entry = ActivityEntry::from_mutation(&event);
        assert_eq!(entry.kind, ActivityKind::ExpenseCreated);
        assert_eq!(entry.entity_id, "exp-2");
        assert_eq!(entry.user_id, "user-9");
        assert!(entry.summary.contains("expense"));
    }

    #[test]
    fn test_active_admin_count() {
        let group = Group::new("grp-1", "Trip", 500.0)
            .with_member(GroupMember::new("u1", MemberRole::Admin))
            .with_member(GroupMember::new("u2", MemberRole::Admin).with_status(MemberStatus::Inactive))
            .with_member(GroupMember::new("u3", MemberRole::Member));
        assert_eq!(group.active_admin_count(), 1);
    }
}
