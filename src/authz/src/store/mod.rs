//! Persistence boundary
//!
//! The engine reads and writes entities only through these repository traits.
//! Updates of roles and groups are optimistic: the caller passes the entity
//! with the version it read, the store rejects stale versions with
//! [`StoreError::Conflict`] and bumps the version on success.

pub mod memory;

pub use memory::{MemoryStore, Snapshot};

use crate::types::{
    Group, GroupMembership, GroupRole, Organization, Permission, Role, RoleAssignment,
};
use async_trait::async_trait;
use thiserror::Error;

/// Store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Role>>;

    /// All roles, soft-deleted included, ordered by id
    async fn get_all(&self) -> StoreResult<Vec<Role>>;

    async fn get_child_roles(&self, parent_id: &str) -> StoreResult<Vec<Role>>;

    /// Version-checked write; returns the stored role
    async fn update(&self, role: Role) -> StoreResult<Role>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Group>>;

    async fn get_children(&self, parent_id: &str) -> StoreResult<Vec<Group>>;

    async fn get_by_organization(&self, organization_id: &str) -> StoreResult<Vec<Group>>;

    /// Version-checked write; returns the stored group
    async fn update(&self, group: Group) -> StoreResult<Group>;
}

#[async_trait]
pub trait GroupMembershipRepository: Send + Sync {
    /// Every membership of the principal, active or not
    async fn get_by_principal_id(&self, principal_id: &str) -> StoreResult<Vec<GroupMembership>>;

    async fn get_membership(
        &self,
        group_id: &str,
        principal_id: &str,
    ) -> StoreResult<Option<GroupMembership>>;

    /// Conflict if a membership for (group, principal) already exists
    async fn create(&self, membership: GroupMembership) -> StoreResult<()>;

    /// NotFound if no membership for (group, principal) exists
    async fn update(&self, membership: GroupMembership) -> StoreResult<()>;
}

#[async_trait]
pub trait GroupRoleRepository: Send + Sync {
    async fn get_by_group_id(&self, group_id: &str) -> StoreResult<Vec<GroupRole>>;

    /// Conflict if a grant for (group, role) already exists
    async fn create(&self, grant: GroupRole) -> StoreResult<()>;

    async fn update(&self, grant: GroupRole) -> StoreResult<()>;
}

#[async_trait]
pub trait RoleAssignmentRepository: Send + Sync {
    async fn get_by_principal_id(&self, principal_id: &str) -> StoreResult<Vec<RoleAssignment>>;

    /// Conflict if an assignment for (principal, role, organization) exists
    async fn create(&self, assignment: RoleAssignment) -> StoreResult<()>;

    async fn update(&self, assignment: RoleAssignment) -> StoreResult<()>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    /// Permissions linked to the role through active role-permission rows
    async fn get_by_role_id(&self, role_id: &str) -> StoreResult<Vec<Permission>>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Organization>>;
}

/// A backend implementing every repository
pub trait AuthzStore:
    RoleRepository
    + GroupRepository
    + GroupMembershipRepository
    + GroupRoleRepository
    + RoleAssignmentRepository
    + PermissionRepository
    + OrganizationRepository
{
}

impl<T> AuthzStore for T where
    T: RoleRepository
        + GroupRepository
        + GroupMembershipRepository
        + GroupRoleRepository
        + RoleAssignmentRepository
        + PermissionRepository
        + OrganizationRepository
{
}
