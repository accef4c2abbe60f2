//! In-memory store implementing every repository

use super::*;
use crate::types::{GroupId, OrganizationId, PermissionId, PrincipalId, RoleId, RolePermission};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Serializable dump of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub organizations: Vec<Organization>,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
    pub role_permissions: Vec<RolePermission>,
    pub groups: Vec<Group>,
    pub memberships: Vec<GroupMembership>,
    pub group_roles: Vec<GroupRole>,
    pub assignments: Vec<RoleAssignment>,
}

type AssignmentKey = (PrincipalId, RoleId, Option<OrganizationId>);

#[derive(Default)]
struct MemoryState {
    organizations: HashMap<OrganizationId, Organization>,
    roles: HashMap<RoleId, Role>,
    permissions: HashMap<PermissionId, Permission>,
    role_permissions: Vec<RolePermission>,
    groups: HashMap<GroupId, Group>,
    memberships: HashMap<(GroupId, PrincipalId), GroupMembership>,
    group_roles: HashMap<(GroupId, RoleId), GroupRole>,
    assignments: HashMap<AssignmentKey, RoleAssignment>,
}

fn assignment_key(assignment: &RoleAssignment) -> AssignmentKey {
    (
        assignment.principal_id.clone(),
        assignment.role_id.clone(),
        assignment.organization_id.clone(),
    )
}

fn sorted<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(key);
    items
}

/// Repository backend holding all entities in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = MemoryState {
            role_permissions: snapshot.role_permissions,
            ..Default::default()
        };
        state.organizations = snapshot
            .organizations
            .into_iter()
            .map(|o| (o.id.clone(), o))
            .collect();
        state.roles = snapshot.roles.into_iter().map(|r| (r.id.clone(), r)).collect();
        state.permissions = snapshot
            .permissions
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        state.groups = snapshot.groups.into_iter().map(|g| (g.id.clone(), g)).collect();
        state.memberships = snapshot
            .memberships
            .into_iter()
            .map(|m| ((m.group_id.clone(), m.principal_id.clone()), m))
            .collect();
        state.group_roles = snapshot
            .group_roles
            .into_iter()
            .map(|g| ((g.group_id.clone(), g.role_id.clone()), g))
            .collect();
        state.assignments = snapshot
            .assignments
            .into_iter()
            .map(|a| (assignment_key(&a), a))
            .collect();

        debug!(
            roles = state.roles.len(),
            groups = state.groups.len(),
            memberships = state.memberships.len(),
            "Loaded store snapshot"
        );

        Self {
            state: Arc::new(RwLock::new(state)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::from_snapshot(serde_json::from_str(json)?))
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            organizations: sorted(state.organizations.values().cloned().collect(), |o: &Organization| o.id.clone()),
            roles: sorted(state.roles.values().cloned().collect(), |r: &Role| r.id.clone()),
            permissions: sorted(state.permissions.values().cloned().collect(), |p: &Permission| p.id.clone()),
            role_permissions: state.role_permissions.clone(),
            groups: sorted(state.groups.values().cloned().collect(), |g: &Group| g.id.clone()),
            memberships: sorted(state.memberships.values().cloned().collect(), |m: &GroupMembership| {
                (m.group_id.clone(), m.principal_id.clone())
            }),
            group_roles: sorted(state.group_roles.values().cloned().collect(), |g: &GroupRole| {
                (g.group_id.clone(), g.role_id.clone())
            }),
            assignments: sorted(state.assignments.values().cloned().collect(), assignment_key),
        }
    }

    /// Simulate a backend outage: every call fails with [`StoreError::Backend`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory store unavailable".to_string()));
        }
        Ok(())
    }

    pub async fn put_organization(&self, organization: Organization) {
        let mut state = self.state.write().await;
        state.organizations.insert(organization.id.clone(), organization);
    }

    pub async fn put_role(&self, role: Role) {
        let mut state = self.state.write().await;
        state.roles.insert(role.id.clone(), role);
    }

    pub async fn put_permission(&self, permission: Permission) {
        let mut state = self.state.write().await;
        state.permissions.insert(permission.id.clone(), permission);
    }

    /// Attach an existing permission to a role
    pub async fn grant_permission(&self, role_id: &str, permission_id: &str) {
        let mut state = self.state.write().await;
        state.role_permissions.push(RolePermission {
            role_id: role_id.to_string(),
            permission_id: permission_id.to_string(),
            is_active: true,
        });
    }

    pub async fn put_group(&self, group: Group) {
        let mut state = self.state.write().await;
        state.groups.insert(group.id.clone(), group);
    }

    pub async fn put_membership(&self, membership: GroupMembership) {
        let mut state = self.state.write().await;
        let key = (membership.group_id.clone(), membership.principal_id.clone());
        state.memberships.insert(key, membership);
    }

    pub async fn put_group_role(&self, grant: GroupRole) {
        let mut state = self.state.write().await;
        let key = (grant.group_id.clone(), grant.role_id.clone());
        state.group_roles.insert(key, grant);
    }

    pub async fn put_assignment(&self, assignment: RoleAssignment) {
        let mut state = self.state.write().await;
        state.assignments.insert(assignment_key(&assignment), assignment);
    }
}

#[async_trait]
impl RoleRepository for MemoryStore {
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Role>> {
        self.guard()?;
        let state = self.state.read().await;
        Ok(state.roles.get(id).cloned())
    }

    async fn get_all(&self) -> StoreResult<Vec<Role>> {
        self.guard()?;
        let state = self.state.read().await;
        Ok(sorted(state.roles.values().cloned().collect(), |r: &Role| r.id.clone()))
    }

    async fn get_child_roles(&self, parent_id: &str) -> StoreResult<Vec<Role>> {
        self.guard()?;
        let state = self.state.read().await;
        let children = state
            .roles
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        Ok(sorted(children, |r: &Role| r.id.clone()))
    }

    async fn update(&self, mut role: Role) -> StoreResult<Role> {
        self.guard()?;
        let mut state = self.state.write().await;
        let stored = state
            .roles
            .get_mut(&role.id)
            .ok_or_else(|| StoreError::NotFound(format!("role {}", role.id)))?;

        if stored.version != role.version {
            return Err(StoreError::Conflict(format!(
                "role {} was modified concurrently (expected version {}, found {})",
                role.id, role.version, stored.version
            )));
        }

        role.version += 1;
        *stored = role.clone();
        Ok(role)
    }
}

#[async_trait]
impl GroupRepository for MemoryStore {
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Group>> {
        self.guard()?;
        let state = self.state.read().await;
        Ok(state.groups.get(id).cloned())
    }

    async fn get_children(&self, parent_id: &str) -> StoreResult<Vec<Group>> {
        self.guard()?;
        let state = self.state.read().await;
        let children = state
            .groups
            .values()
            .filter(|g| g.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        Ok(sorted(children, |g: &Group| g.id.clone()))
    }

    async fn get_by_organization(&self, organization_id: &str) -> StoreResult<Vec<Group>> {
        self.guard()?;
        let state = self.state.read().await;
        let groups = state
            .groups
            .values()
            .filter(|g| g.organization_id == organization_id)
            .cloned()
            .collect();
        Ok(sorted(groups, |g: &Group| g.id.clone()))
    }

    async fn update(&self, mut group: Group) -> StoreResult<Group> {
        self.guard()?;
        let mut state = self.state.write().await;
        let stored = state
            .groups
            .get_mut(&group.id)
            .ok_or_else(|| StoreError::NotFound(format!("group {}", group.id)))?;

        if stored.version != group.version {
            return Err(StoreError::Conflict(format!(
                "group {} was modified concurrently (expected version {}, found {})",
                group.id, group.version, stored.version
            )));
        }

        group.version += 1;
        *stored = group.clone();
        Ok(group)
    }
}

#[async_trait]
impl GroupMembershipRepository for MemoryStore {
    async fn get_by_principal_id(&self, principal_id: &str) -> StoreResult<Vec<GroupMembership>> {
        self.guard()?;
        let state = self.state.read().await;
        let memberships = state
            .memberships
            .values()
            .filter(|m| m.principal_id == principal_id)
            .cloned()
            .collect();
        Ok(sorted(memberships, |m: &GroupMembership| m.group_id.clone()))
    }

    async fn get_membership(
        &self,
        group_id: &str,
        principal_id: &str,
    ) -> StoreResult<Option<GroupMembership>> {
        self.guard()?;
        let state = self.state.read().await;
        Ok(state
            .memberships
            .get(&(group_id.to_string(), principal_id.to_string()))
            .cloned())
    }

    async fn create(&self, membership: GroupMembership) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.write().await;
        let key = (membership.group_id.clone(), membership.principal_id.clone());
        if state.memberships.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "membership of {} in group {} already exists",
                key.1, key.0
            )));
        }
        state.memberships.insert(key, membership);
        Ok(())
    }

    async fn update(&self, membership: GroupMembership) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.write().await;
        let key = (membership.group_id.clone(), membership.principal_id.clone());
        match state.memberships.get_mut(&key) {
            Some(stored) => {
                *stored = membership;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "membership of {} in group {}",
                key.1, key.0
            ))),
        }
    }
}

#[async_trait]
impl GroupRoleRepository for MemoryStore {
    async fn get_by_group_id(&self, group_id: &str) -> StoreResult<Vec<GroupRole>> {
        self.guard()?;
        let state = self.state.read().await;
        let grants = state
            .group_roles
            .values()
            .filter(|g| g.group_id == group_id)
            .cloned()
            .collect();
        Ok(sorted(grants, |g: &GroupRole| g.role_id.clone()))
    }

    async fn create(&self, grant: GroupRole) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.write().await;
        let key = (grant.group_id.clone(), grant.role_id.clone());
        if state.group_roles.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "role {} already granted to group {}",
                key.1, key.0
            )));
        }
        state.group_roles.insert(key, grant);
        Ok(())
    }

    async fn update(&self, grant: GroupRole) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.write().await;
        let key = (grant.group_id.clone(), grant.role_id.clone());
        match state.group_roles.get_mut(&key) {
            Some(stored) => {
                *stored = grant;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "grant of role {} to group {}",
                key.1, key.0
            ))),
        }
    }
}

#[async_trait]
impl RoleAssignmentRepository for MemoryStore {
    async fn get_by_principal_id(&self, principal_id: &str) -> StoreResult<Vec<RoleAssignment>> {
        self.guard()?;
        let state = self.state.read().await;
        let assignments = state
            .assignments
            .values()
            .filter(|a| a.principal_id == principal_id)
            .cloned()
            .collect();
        Ok(sorted(assignments, assignment_key))
    }

    async fn create(&self, assignment: RoleAssignment) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.write().await;
        let key = assignment_key(&assignment);
        if state.assignments.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "role {} already assigned to {}",
                key.1, key.0
            )));
        }
        state.assignments.insert(key, assignment);
        Ok(())
    }

    async fn update(&self, assignment: RoleAssignment) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.state.write().await;
        let key = assignment_key(&assignment);
        match state.assignments.get_mut(&key) {
            Some(stored) => {
                *stored = assignment;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "assignment of role {} to {}",
                key.1, key.0
            ))),
        }
    }
}

#[async_trait]
impl PermissionRepository for MemoryStore {
    async fn get_by_role_id(&self, role_id: &str) -> StoreResult<Vec<Permission>> {
        self.guard()?;
        let state = self.state.read().await;
        let mut permissions: Vec<Permission> = state
            .role_permissions
            .iter()
            .filter(|rp| rp.is_active && rp.role_id == role_id)
            .filter_map(|rp| state.permissions.get(&rp.permission_id).cloned())
            .collect();
        permissions.sort_by(|a, b| a.id.cmp(&b.id));
        permissions.dedup_by(|a, b| a.id == b.id);
        Ok(permissions)
    }
}

#[async_trait]
impl OrganizationRepository for MemoryStore {
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Organization>> {
        self.guard()?;
        let state = self.state.read().await;
        Ok(state.organizations.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_role_update_checks_version() {
        let store = MemoryStore::new();
        store.put_role(Role::new("r1", "Viewer")).await;

        let role = RoleRepository::get_by_id(&store, "r1").await.unwrap().unwrap();
        let updated = RoleRepository::update(&store, role.clone()).await.unwrap();
        assert_eq!(updated.version, 1);

        // Stale write with the version read before the first update
        let stale = RoleRepository::update(&store, role).await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_membership_create_conflict() {
        let store = MemoryStore::new();
        let membership = GroupMembership::new("g1", "alice");

        GroupMembershipRepository::create(&store, membership.clone()).await.unwrap();
        let again = GroupMembershipRepository::create(&store, membership).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = OrganizationRepository::get_by_id(&store, "o1").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));

        store.set_unavailable(false);
        assert!(OrganizationRepository::get_by_id(&store, "o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permissions_follow_active_links() {
        let store = MemoryStore::new();
        store.put_permission(Permission::new("p1", "documents", "read")).await;
        store.put_permission(Permission::new("p2", "documents", "write")).await;
        store.grant_permission("r1", "p1").await;
        {
            let mut state = store.state.write().await;
            state.role_permissions.push(RolePermission {
                role_id: "r1".into(),
                permission_id: "p2".into(),
                is_active: false,
            });
        }

        let permissions = PermissionRepository::get_by_role_id(&store, "r1").await.unwrap();
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].id, "p1");
    }

    #[tokio::test]
    async fn test_snapshot_json() {
        let json = r#"{
            "organizations": [{"id": "acme", "name": "Acme"}],
            "roles": [{"id": "viewer", "name": "Viewer"}],
            "groups": [{"id": "eng", "name": "Engineering", "organization_id": "acme"}],
            "memberships": [{"group_id": "eng", "principal_id": "alice"}]
        }"#;

        let store = MemoryStore::from_json(json).unwrap();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.organizations.len(), 1);
        assert_eq!(snapshot.memberships[0].principal_id, "alice");
        assert!(snapshot.memberships[0].is_active);
    }
}
