//! Group hierarchy, membership and group role grants
//!
//! Groups form one tree per organization. Structural mutations are serialized
//! per organization; membership changes invalidate a single principal, while
//! structure and grant changes sweep the whole organization.

use super::{assemble_forest, AncestorWalk};
use crate::context::RequestContext;
use crate::error::{AuthzError, Result};
use crate::invalidation::CacheInvalidator;
use crate::store::{GroupMembershipRepository, GroupRepository, GroupRoleRepository, RoleRepository};
use crate::cache::CacheService;
use crate::types::{
    Group, GroupMembership, GroupNode, GroupRole, OrganizationId, PrincipalId, PrincipalType,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Request to add a principal to a group
#[derive(Debug, Clone)]
pub struct AddMember {
    pub group_id: String,
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub effective_from: Option<DateTime<Utc>>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl AddMember {
    pub fn new(group_id: impl Into<String>, principal_id: impl Into<PrincipalId>) -> Self {
        Self {
            group_id: group_id.into(),
            principal_id: principal_id.into(),
            principal_type: PrincipalType::User,
            effective_from: None,
            effective_to: None,
        }
    }

    pub fn service(mut self) -> Self {
        self.principal_type = PrincipalType::Service;
        self
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

    fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() || self.principal_id.trim().is_empty() {
            return Err(AuthzError::Validation(
                "group id and principal id are required".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (self.effective_from, self.effective_to) {
            if to <= from {
                return Err(AuthzError::Validation(
                    "effective_to must be after effective_from".to_string(),
                ));
            }
        }
        Ok(())
    }
}

pub struct GroupService {
    groups: Arc<dyn GroupRepository>,
    memberships: Arc<dyn GroupMembershipRepository>,
    grants: Arc<dyn GroupRoleRepository>,
    roles: Arc<dyn RoleRepository>,
    invalidator: CacheInvalidator,
    org_locks: DashMap<OrganizationId, Arc<Mutex<()>>>,
}

impl GroupService {
    pub fn new(
        groups: Arc<dyn GroupRepository>,
        memberships: Arc<dyn GroupMembershipRepository>,
        grants: Arc<dyn GroupRoleRepository>,
        roles: Arc<dyn RoleRepository>,
        cache: Arc<dyn CacheService>,
    ) -> Self {
        Self {
            groups,
            memberships,
            grants,
            roles,
            invalidator: CacheInvalidator::new(cache),
            org_locks: DashMap::new(),
        }
    }

    async fn lock_organization(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
    ) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .org_locks
            .entry(organization_id.to_string())
            .or_default()
            .clone();
        ctx.run(async { Ok(lock.lock_owned().await) }).await
    }

    /// Missing and soft-deleted groups are NotFound
    async fn load_group(&self, ctx: &RequestContext, group_id: &str) -> Result<Group> {
        match ctx.call(self.groups.get_by_id(group_id)).await? {
            Some(group) if group.deleted_at.is_none() => Ok(group),
            _ => Err(AuthzError::NotFound(format!("group {}", group_id))),
        }
    }

    pub async fn get_group(&self, ctx: &RequestContext, group_id: &str) -> Result<Option<Group>> {
        ctx.call(self.groups.get_by_id(group_id)).await
    }

    /// The group followed by its ancestors, nearest first.
    ///
    /// The walk stops before an inactive, deleted or cross-organization
    /// ancestor; an unusable starting group yields an empty chain.
    pub async fn ancestor_chain(&self, ctx: &RequestContext, group: Group) -> Result<Vec<Group>> {
        if !group.is_usable() {
            return Ok(Vec::new());
        }

        let organization_id = group.organization_id.clone();
        let mut visited = HashSet::from([group.id.clone()]);
        let mut next = group.parent_id.clone();
        let mut chain = vec![group];

        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) {
                warn!(group_id = %parent_id, "Existing cycle in group hierarchy");
                break;
            }
            let Some(parent) = ctx.call(self.groups.get_by_id(&parent_id)).await? else {
                break;
            };
            if !parent.is_usable() || parent.organization_id != organization_id {
                break;
            }
            next = parent.parent_id.clone();
            chain.push(parent);
        }

        Ok(chain)
    }

    async fn ensure_no_cycle(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<()> {
        let mut walk = AncestorWalk::new(child_id);
        let mut current = Some(parent_id.to_string());

        while let Some(group_id) = current {
            if !walk.visit(&group_id)? {
                break;
            }
            current = ctx
                .call(self.groups.get_by_id(&group_id))
                .await?
                .and_then(|group| group.parent_id);
        }
        Ok(())
    }

    /// Make `child_id` a child of `parent_id`; both must belong to the same
    /// organization and the parent must be active.
    pub async fn add_child_group(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<Group> {
        if parent_id.trim().is_empty() || child_id.trim().is_empty() {
            return Err(AuthzError::Validation(
                "parent and child group ids are required".to_string(),
            ));
        }
        if parent_id == child_id {
            return Err(AuthzError::Validation(format!(
                "group {} cannot be its own parent",
                parent_id
            )));
        }

        let parent = self.load_group(ctx, parent_id).await?;
        let child = self.load_group(ctx, child_id).await?;

        if parent.organization_id != child.organization_id {
            return Err(AuthzError::Validation(format!(
                "groups {} and {} belong to different organizations",
                parent_id, child_id
            )));
        }
        if !parent.is_active {
            return Err(AuthzError::Validation(format!(
                "parent group {} is inactive",
                parent_id
            )));
        }

        let _guard = self.lock_organization(ctx, &parent.organization_id).await?;

        if let Some(existing) = &child.parent_id {
            return Err(AuthzError::Conflict(format!(
                "group {} already has parent {}",
                child_id, existing
            )));
        }

        self.ensure_no_cycle(ctx, parent_id, child_id).await?;

        let mut updated = child;
        updated.parent_id = Some(parent_id.to_string());
        let stored = ctx.call(self.groups.update(updated)).await?;

        self.invalidator
            .organization(ctx, &stored.organization_id)
            .await?;

        info!(
            org = %stored.organization_id,
            parent = %parent_id,
            child = %child_id,
            "Added child group"
        );
        Ok(stored)
    }

    pub async fn remove_child_group(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<Group> {
        let child = self.load_group(ctx, child_id).await?;
        let _guard = self.lock_organization(ctx, &child.organization_id).await?;

        if child.parent_id.as_deref() != Some(parent_id) {
            return Err(AuthzError::Conflict(format!(
                "group {} is not a child of {}",
                child_id, parent_id
            )));
        }

        let mut updated = child;
        updated.parent_id = None;
        let stored = ctx.call(self.groups.update(updated)).await?;

        self.invalidator
            .organization(ctx, &stored.organization_id)
            .await?;

        info!(
            org = %stored.organization_id,
            parent = %parent_id,
            child = %child_id,
            "Removed child group"
        );
        Ok(stored)
    }

    /// Every non-deleted group of the organization as a forest
    pub async fn get_group_hierarchy(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
    ) -> Result<Vec<GroupNode>> {
        let groups: Vec<Group> = ctx
            .call(self.groups.get_by_organization(organization_id))
            .await?
            .into_iter()
            .filter(|group| group.deleted_at.is_none())
            .collect();

        Ok(assemble_forest(groups))
    }

    pub async fn get_group_with_children(
        &self,
        ctx: &RequestContext,
        group_id: &str,
    ) -> Result<GroupNode> {
        let root = self.load_group(ctx, group_id).await?;

        let mut seen = HashSet::from([root.id.clone()]);
        let mut queue = VecDeque::from([root.id.clone()]);
        let mut subtree = vec![root];

        while let Some(id) = queue.pop_front() {
            for child in ctx.call(self.groups.get_children(&id)).await? {
                if child.deleted_at.is_some() || !seen.insert(child.id.clone()) {
                    continue;
                }
                queue.push_back(child.id.clone());
                subtree.push(child);
            }
        }

        assemble_forest(subtree)
            .into_iter()
            .find(|node| node.item.id == group_id)
            .ok_or_else(|| {
                AuthzError::internal(format!("subtree of group {} lost its root", group_id))
            })
    }

    /// Add a principal to a group. An inactive membership is reactivated with
    /// the new window.
    pub async fn add_member(
        &self,
        ctx: &RequestContext,
        request: AddMember,
    ) -> Result<GroupMembership> {
        request.validate()?;

        let group = self.load_group(ctx, &request.group_id).await?;
        if !group.is_active {
            return Err(AuthzError::Validation(format!(
                "group {} is inactive",
                group.id
            )));
        }

        let _guard = self.lock_organization(ctx, &group.organization_id).await?;

        let membership = GroupMembership {
            group_id: group.id.clone(),
            principal_id: request.principal_id.clone(),
            principal_type: request.principal_type,
            is_active: true,
            effective_from: request.effective_from,
            effective_to: request.effective_to,
        };

        match ctx
            .call(self.memberships.get_membership(&group.id, &request.principal_id))
            .await?
        {
            Some(existing) if existing.is_active => {
                return Err(AuthzError::Conflict(format!(
                    "{} is already a member of group {}",
                    request.principal_id, group.id
                )));
            }
            Some(_) => ctx.call(self.memberships.update(membership.clone())).await?,
            None => ctx.call(self.memberships.create(membership.clone())).await?,
        }

        self.invalidator
            .principal(ctx, &group.organization_id, &request.principal_id)
            .await?;

        info!(
            org = %group.organization_id,
            group = %group.id,
            principal = %request.principal_id,
            "Added group member"
        );
        Ok(membership)
    }

    /// Soft-deactivate a membership
    pub async fn remove_member(
        &self,
        ctx: &RequestContext,
        group_id: &str,
        principal_id: &str,
    ) -> Result<()> {
        let group = ctx
            .call(self.groups.get_by_id(group_id))
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("group {}", group_id)))?;

        let _guard = self.lock_organization(ctx, &group.organization_id).await?;

        let mut membership = match ctx
            .call(self.memberships.get_membership(group_id, principal_id))
            .await?
        {
            Some(m) if m.is_active => m,
            _ => {
                return Err(AuthzError::NotFound(format!(
                    "active membership of {} in group {}",
                    principal_id, group_id
                )))
            }
        };

        membership.is_active = false;
        ctx.call(self.memberships.update(membership)).await?;

        self.invalidator
            .principal(ctx, &group.organization_id, principal_id)
            .await?;

        info!(
            org = %group.organization_id,
            group = %group_id,
            principal = %principal_id,
            "Removed group member"
        );
        Ok(())
    }

    /// All memberships of a principal, active and inactive
    pub async fn get_by_principal_id(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Vec<GroupMembership>> {
        ctx.call(self.memberships.get_by_principal_id(principal_id))
            .await
    }

    pub async fn get_group_roles(&self, ctx: &RequestContext, group_id: &str) -> Result<Vec<GroupRole>> {
        ctx.call(self.grants.get_by_group_id(group_id)).await
    }

    /// Grant a role to every member of the group and its descendant groups
    pub async fn assign_role_to_group(
        &self,
        ctx: &RequestContext,
        group_id: &str,
        role_id: &str,
    ) -> Result<GroupRole> {
        let group = self.load_group(ctx, group_id).await?;
        match ctx.call(self.roles.get_by_id(role_id)).await? {
            Some(role) if !role.is_deleted() => {}
            _ => return Err(AuthzError::NotFound(format!("role {}", role_id))),
        }

        let _guard = self.lock_organization(ctx, &group.organization_id).await?;

        let existing = ctx
            .call(self.grants.get_by_group_id(group_id))
            .await?
            .into_iter()
            .find(|grant| grant.role_id == role_id);

        let grant = match existing {
            Some(grant) if grant.is_active => {
                return Err(AuthzError::Conflict(format!(
                    "role {} is already granted to group {}",
                    role_id, group_id
                )));
            }
            Some(mut grant) => {
                grant.is_active = true;
                ctx.call(self.grants.update(grant.clone())).await?;
                grant
            }
            None => {
                let grant = GroupRole::new(group_id, role_id, group.organization_id.clone());
                ctx.call(self.grants.create(grant.clone())).await?;
                grant
            }
        };

        self.invalidator
            .organization(ctx, &group.organization_id)
            .await?;

        info!(
            org = %group.organization_id,
            group = %group_id,
            role = %role_id,
            "Granted role to group"
        );
        Ok(grant)
    }

    pub async fn remove_role_from_group(
        &self,
        ctx: &RequestContext,
        group_id: &str,
        role_id: &str,
    ) -> Result<()> {
        let group = ctx
            .call(self.groups.get_by_id(group_id))
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("group {}", group_id)))?;

        let _guard = self.lock_organization(ctx, &group.organization_id).await?;

        let mut grant = ctx
            .call(self.grants.get_by_group_id(group_id))
            .await?
            .into_iter()
            .find(|grant| grant.role_id == role_id && grant.is_active)
            .ok_or_else(|| {
                AuthzError::NotFound(format!("grant of role {} to group {}", role_id, group_id))
            })?;

        grant.is_active = false;
        ctx.call(self.grants.update(grant)).await?;

        self.invalidator
            .organization(ctx, &group.organization_id)
            .await?;

        info!(
            org = %group.organization_id,
            group = %group_id,
            role = %role_id,
            "Revoked role from group"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::invalidation::effective_roles_key;
    use crate::store::MemoryStore;
    use crate::types::Role;
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> (GroupService, Arc<MemoryStore>, Arc<InMemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        store.put_group(Group::new("tech", "Technology", "acme")).await;
        store.put_group(Group::new("eng", "Engineering", "acme").with_parent("tech")).await;
        store.put_group(Group::new("ops", "Operations", "acme")).await;
        store.put_group(Group::new("other", "Other", "globex")).await;
        store.put_role(Role::new("dev", "Developer")).await;

        let cache = Arc::new(InMemoryCache::default());
        let service = GroupService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            cache.clone(),
        );
        (service, store, cache)
    }

    #[tokio::test]
    async fn test_add_member_conflict_and_reactivate() {
        let (service, _, _) = setup().await;
        let ctx = RequestContext::background();

        service.add_member(&ctx, AddMember::new("eng", "alice")).await.unwrap();
        assert!(service
            .add_member(&ctx, AddMember::new("eng", "alice"))
            .await
            .unwrap_err()
            .is_conflict());

        service.remove_member(&ctx, "eng", "alice").await.unwrap();
        let again = service.add_member(&ctx, AddMember::new("eng", "alice")).await.unwrap();
        assert!(again.is_active);

        let memberships = service.get_by_principal_id(&ctx, "alice").await.unwrap();
        assert_eq!(memberships.len(), 1);
    }

    #[tokio::test]
    async fn test_add_member_rejects_bad_window() {
        let (service, _, _) = setup().await;
        let now = Utc::now();

        let request = AddMember::new("eng", "alice").with_window(Some(now), Some(now));
        let result = service.add_member(&RequestContext::background(), request).await;
        assert!(matches!(result, Err(AuthzError::Validation(_))));
    }

    #[tokio::test]
    async fn test_add_member_inactive_group() {
        let (service, store, _) = setup().await;
        let mut group = Group::new("old", "Old", "acme");
        group.is_active = false;
        store.put_group(group).await;

        let result = service
            .add_member(&RequestContext::background(), AddMember::new("old", "alice"))
            .await;
        assert!(matches!(result, Err(AuthzError::Validation(_))));
    }

    #[tokio::test]
    async fn test_remove_member_not_found() {
        let (service, _, _) = setup().await;
        let result = service
            .remove_member(&RequestContext::background(), "eng", "nobody")
            .await;
        assert!(matches!(result, Err(AuthzError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_membership_change_invalidates_principal_only() {
        let (service, _, cache) = setup().await;
        let ctx = RequestContext::background();
        cache.set(&effective_roles_key("acme", "alice"), json!([]), 300).await.unwrap();
        cache.set(&effective_roles_key("acme", "bob"), json!([]), 300).await.unwrap();

        service.add_member(&ctx, AddMember::new("eng", "alice")).await.unwrap();

        assert!(cache.get(&effective_roles_key("acme", "alice")).await.unwrap().is_none());
        assert!(cache.get(&effective_roles_key("acme", "bob")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_grant_change_sweeps_organization() {
        let (service, _, cache) = setup().await;
        let ctx = RequestContext::background();
        cache.set(&effective_roles_key("acme", "alice"), json!([]), 300).await.unwrap();
        cache.set(&effective_roles_key("acme", "bob"), json!([]), 300).await.unwrap();
        cache.set(&effective_roles_key("globex", "bob"), json!([]), 300).await.unwrap();

        service.assign_role_to_group(&ctx, "tech", "dev").await.unwrap();

        assert_eq!(
            cache.keys("org:*").await.unwrap(),
            vec![effective_roles_key("globex", "bob")]
        );
        assert!(service
            .assign_role_to_group(&ctx, "tech", "dev")
            .await
            .unwrap_err()
            .is_conflict());

        service.remove_role_from_group(&ctx, "tech", "dev").await.unwrap();
        let grants = service.get_group_roles(&ctx, "tech").await.unwrap();
        assert!(!grants[0].is_active);
    }

    #[tokio::test]
    async fn test_group_edges() {
        let (service, _, _) = setup().await;
        let ctx = RequestContext::background();

        assert!(matches!(
            service.add_child_group(&ctx, "tech", "other").await,
            Err(AuthzError::Validation(_))
        ));
        assert!(matches!(
            service.add_child_group(&ctx, "eng", "tech").await,
            Err(AuthzError::CircularDependency(_))
        ));

        let ops = service.add_child_group(&ctx, "tech", "ops").await.unwrap();
        assert_eq!(ops.parent_id.as_deref(), Some("tech"));

        let tree = service.get_group_hierarchy(&ctx, "acme").await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].size(), 3);

        service.remove_child_group(&ctx, "tech", "ops").await.unwrap();
        let subtree = service.get_group_with_children(&ctx, "tech").await.unwrap();
        assert_eq!(subtree.size(), 2);
    }

    #[tokio::test]
    async fn test_ancestor_chain_stops_at_inactive() {
        let (service, store, _) = setup().await;
        let ctx = RequestContext::background();

        let eng = service.get_group(&ctx, "eng").await.unwrap().unwrap();
        let chain = service.ancestor_chain(&ctx, eng.clone()).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["eng", "tech"]);

        let mut tech = Group::new("tech", "Technology", "acme");
        tech.is_active = false;
        store.put_group(tech).await;

        let chain = service.ancestor_chain(&ctx, eng).await.unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn test_window_membership_round_trip() {
        let (service, _, _) = setup().await;
        let now = Utc::now();
        let request = AddMember::new("eng", "svc-1")
            .service()
            .with_window(Some(now), Some(now + Duration::hours(1)));

        let membership = service
            .add_member(&RequestContext::background(), request)
            .await
            .unwrap();
        assert_eq!(membership.principal_type, PrincipalType::Service);
        assert!(membership.is_effective(now));
    }
}
