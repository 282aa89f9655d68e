//! Group membership registry and its repository port.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::types::{Group, GroupMember, MemberRole, MemberStatus};

/// Read-mostly source of group data, owned outside the sync core.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get_group(&self, id: &str) -> Result<Option<Group>>;
    async fn list_groups_for_user(&self, user_id: &str) -> Result<Vec<Group>>;
}

/// Session-owned registry of groups, indexed by group id.
///
/// Loaded from a [`GroupRepository`] at session start. Membership changes
/// are applied here and propagate to other clients as mutation events; the
/// repository's owner applies them durably.
#[derive(Default)]
pub struct GroupRegistry {
    groups: HashMap<String, Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull every group the user belongs to from the repository.
    pub async fn load_for_user(
        &mut self,
        repository: &dyn GroupRepository,
        user_id: &str,
    ) -> Result<usize> {
        let groups = repository.list_groups_for_user(user_id).await?;
        let count = groups.len();
        for group in groups {
            self.groups.insert(group.id.clone(), group);
        }
        info!(user_id, count, "Loaded groups for user");
        Ok(count)
    }

    /// Register a new group. Duplicate ids and negative thresholds are
    /// rejected.
    pub fn create_group(&mut self, group: Group) -> Result<()> {
        if group.require_approval_threshold < 0.0 {
            return Err(SyncError::Validation(format!(
                "approval threshold must not be negative, got {}",
                group.require_approval_threshold
            )));
        }
        if self.groups.contains_key(&group.id) {
            return Err(SyncError::State(format!(
                "group {} already exists",
                group.id
            )));
        }
        debug!(group_id = %group.id, "Created group");
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn groups_for_user(&self, user_id: &str) -> Vec<&Group> {
        self.groups
            .values()
            .filter(|group| group.member(user_id).is_some())
            .collect()
    }

    /// Role of an active member, `None` for non-members and members whose
    /// status is not active.
    pub fn active_role(&self, group_id: &str, user_id: &str) -> Option<MemberRole> {
        self.groups
            .get(group_id)?
            .member(user_id)
            .filter(|member| member.status == MemberStatus::Active)
            .map(|member| member.role)
    }

    /// Friendly name for a user from any group membership carrying one.
    pub fn display_name(&self, user_id: &str) -> Option<String> {
        self.groups
            .values()
            .filter_map(|group| group.member(user_id))
            .find_map(|member| member.display_name.clone())
    }

    /// Add a member to a group.
    pub fn add_member(&mut self, group_id: &str, member: GroupMember) -> Result<()> {
        let group = self.require_group_mut(group_id)?;
        if group.member(&member.user_id).is_some() {
            return Err(SyncError::State(format!(
                "{} is already a member of {}",
                member.user_id, group_id
            )));
        }
        info!(group_id, user_id = %member.user_id, role = %member.role, "Member added");
        group.members.push(member);
        Ok(())
    }

    /// Remove a member. Removing the sole active admin is rejected and
    /// leaves membership unchanged.
    pub fn remove_member(&mut self, group_id: &str, user_id: &str) -> Result<GroupMember> {
        let group = self.require_group_mut(group_id)?;
        let position = group
            .members
            .iter()
            .position(|member| member.user_id == user_id)
            .ok_or_else(|| {
                SyncError::State(format!("{} is not a member of {}", user_id, group_id))
            })?;

        if group.members[position].is_active_admin() && group.active_admin_count() == 1 {
            return Err(SyncError::State(format!(
                "cannot remove the last active admin of {}",
                group_id
            )));
        }

        let removed = group.members.remove(position);
        info!(group_id, user_id, "Member removed");
        Ok(removed)
    }

    /// Change a member's role. Demoting the sole active admin is rejected.
    pub fn change_role(
        &mut self,
        group_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<MemberRole> {
        let group = self.require_group_mut(group_id)?;
        let last_active_admin = group.active_admin_count() == 1;
        let member = group
            .members
            .iter_mut()
            .find(|member| member.user_id == user_id)
            .ok_or_else(|| {
                SyncError::State(format!("{} is not a member of {}", user_id, group_id))
            })?;

        if member.is_active_admin() && last_active_admin && role != MemberRole::Admin {
            return Err(SyncError::State(format!(
                "cannot demote the last active admin of {}",
                group_id
            )));
        }

        let previous = member.role;
        member.role = role;
        info!(group_id, user_id, from = %previous, to = %role, "Member role changed");
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn require_group_mut(&mut self, group_id: &str) -> Result<&mut Group> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| SyncError::State(format!("unknown group: {}", group_id)))
    }
}
