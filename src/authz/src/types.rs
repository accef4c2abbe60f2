//! Core authorization types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique role identifier
pub type RoleId = String;

/// Unique group identifier
pub type GroupId = String;

/// Unique organization identifier
pub type OrganizationId = String;

/// Principal (user or service) identifier
pub type PrincipalId = String;

/// Unique permission identifier
pub type PermissionId = String;

/// Wildcard accepted in permission resource, action and instance fields
pub const WILDCARD: &str = "*";

fn default_true() -> bool {
    true
}

/// `true` when `now` falls inside the half-open window `[from, to)`.
/// Missing bounds are open.
pub fn within_window(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    from.map_or(true, |from| now >= from) && to.map_or(true, |to| now < to)
}

/// Earliest window bound strictly after `now`, if any.
pub fn next_boundary(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    [from, to].into_iter().flatten().filter(|t| *t > now).min()
}

/// Where a role applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleScope {
    #[default]
    Global,
    Organization,
}

/// Named bundle of permissions, arranged in a single-parent tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub scope: RoleScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<OrganizationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RoleId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Optimistic concurrency version, bumped on every update
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            scope: RoleScope::Global,
            organization_id: None,
            parent_id: None,
            is_active: true,
            version: 0,
            deleted_at: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<RoleId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn in_organization(mut self, organization_id: impl Into<OrganizationId>) -> Self {
        self.scope = RoleScope::Organization;
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Active and not soft-deleted
    pub fn is_usable(&self) -> bool {
        self.is_active && !self.is_deleted()
    }

    /// Usable for a principal evaluated in `organization_id`; `None` admits
    /// only global roles
    pub fn is_usable_in(&self, organization_id: Option<&str>) -> bool {
        let in_scope = match self.scope {
            RoleScope::Global => true,
            RoleScope::Organization => {
                organization_id.is_some() && self.organization_id.as_deref() == organization_id
            }
        };
        self.is_usable() && in_scope
    }
}

/// A (resource, action) grant, optionally scoped to one resource instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub resource: String,
    pub action: String,
    /// `None` or `"*"` covers every instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl Permission {
    pub fn new(
        id: impl Into<PermissionId>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            action: action.into(),
            resource_id: None,
        }
    }

    pub fn for_instance(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Check whether this permission covers the requested access
    pub fn matches(&self, resource: &str, resource_id: Option<&str>, action: &str) -> bool {
        let resource_ok = self.resource == WILDCARD || self.resource == resource;
        let action_ok = self.action == WILDCARD || self.action == action;
        let instance_ok = match self.resource_id.as_deref() {
            None | Some(WILDCARD) => true,
            Some(scoped) => resource_id == Some(scoped),
        };

        resource_ok && action_ok && instance_ok
    }

    /// `resource:action` form used by permission listings
    pub fn key(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }
}

/// Link between a role and a permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn new(id: impl Into<OrganizationId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_active: true,
            deleted_at: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }
}

/// Organizational unit; groups form a per-organization tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<GroupId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn new(
        id: impl Into<GroupId>,
        name: impl Into<String>,
        organization_id: impl Into<OrganizationId>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            organization_id: organization_id.into(),
            parent_id: None,
            is_active: true,
            version: 0,
            deleted_at: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<GroupId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_usable(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    #[default]
    User,
    Service,
}

/// Time-bounded membership of a principal in a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub principal_id: PrincipalId,
    #[serde(default)]
    pub principal_type: PrincipalType,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<DateTime<Utc>>,
}

impl GroupMembership {
    pub fn new(group_id: impl Into<GroupId>, principal_id: impl Into<PrincipalId>) -> Self {
        Self {
            group_id: group_id.into(),
            principal_id: principal_id.into(),
            principal_type: PrincipalType::User,
            is_active: true,
            effective_from: None,
            effective_to: None,
        }
    }

    pub fn with_window(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.effective_from = from;
        self.effective_to = to;
        self
    }

    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && within_window(self.effective_from, self.effective_to, now)
    }
}

/// Role granted to every member of a group (and of its descendant groups)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRole {
    pub group_id: GroupId,
    pub role_id: RoleId,
    pub organization_id: OrganizationId,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<DateTime<Utc>>,
}

impl GroupRole {
    pub fn new(
        group_id: impl Into<GroupId>,
        role_id: impl Into<RoleId>,
        organization_id: impl Into<OrganizationId>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            role_id: role_id.into(),
            organization_id: organization_id.into(),
            is_active: true,
            effective_from: None,
            effective_to: None,
        }
    }

    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && within_window(self.effective_from, self.effective_to, now)
    }
}

/// Role assigned directly to a principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub principal_id: PrincipalId,
    pub role_id: RoleId,
    /// `None` applies in every organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<OrganizationId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl RoleAssignment {
    pub fn new(principal_id: impl Into<PrincipalId>, role_id: impl Into<RoleId>) -> Self {
        Self {
            principal_id: principal_id.into(),
            role_id: role_id.into(),
            organization_id: None,
            is_active: true,
        }
    }

    pub fn in_organization(mut self, organization_id: impl Into<OrganizationId>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Whether the assignment counts when evaluating inside `organization_id`
    pub fn applies_to(&self, organization_id: &str) -> bool {
        self.organization_id
            .as_deref()
            .map_or(true, |org| org == organization_id)
    }
}

/// A role held by a principal at evaluation time, with provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRole {
    pub role_id: RoleId,
    pub is_direct: bool,
    /// Hops from the principal's group to the granting group; 0 for direct
    pub distance: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_group_id: Option<GroupId>,
    /// Group ids from the member's group up to the granting group
    #[serde(default)]
    pub inheritance_path: Vec<GroupId>,
}

impl EffectiveRole {
    pub fn direct(role_id: impl Into<RoleId>) -> Self {
        Self {
            role_id: role_id.into(),
            is_direct: true,
            distance: 0,
            source_group_id: None,
            inheritance_path: Vec::new(),
        }
    }

    pub fn inherited(role_id: impl Into<RoleId>, path: Vec<GroupId>) -> Self {
        let distance = path.len().saturating_sub(1) as u32;
        Self {
            role_id: role_id.into(),
            is_direct: false,
            distance,
            source_group_id: path.last().cloned(),
            inheritance_path: path,
        }
    }
}

/// Node of an assembled hierarchy tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode<T> {
    #[serde(flatten)]
    pub item: T,
    pub children: Vec<TreeNode<T>>,
}

impl<T> TreeNode<T> {
    pub fn leaf(item: T) -> Self {
        Self {
            item,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including the root
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }
}

pub type RoleNode = TreeNode<Role>;
pub type GroupNode = TreeNode<Group>;
