//! Role hierarchy service
//!
//! Roles form a single-parent tree. A role holds the permissions of every
//! role beneath it, so the closure of a role is the role itself plus all of
//! its usable descendants. An inactive or deleted role contributes nothing
//! and hides its subtree.

use super::{assemble_forest, AncestorWalk};
use crate::cache::{get_json, CacheService};
use crate::context::RequestContext;
use crate::error::{AuthzError, Result};
use crate::invalidation::{
    role_descendants_key, role_generation_key, role_key, CacheFence, CacheInvalidator,
};
use crate::store::RoleRepository;
use crate::types::{Role, RoleId, RoleNode};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct RoleHierarchyService {
    roles: Arc<dyn RoleRepository>,
    cache: Arc<dyn CacheService>,
    invalidator: CacheInvalidator,
    closure_ttl_secs: u64,
    /// Serializes cycle check + write across concurrent edge mutations
    mutation_lock: Mutex<()>,
}

fn validate_edge(parent_id: &str, child_id: &str) -> Result<()> {
    if parent_id.trim().is_empty() || child_id.trim().is_empty() {
        return Err(AuthzError::Validation(
            "parent and child role ids are required".to_string(),
        ));
    }
    if parent_id == child_id {
        return Err(AuthzError::Validation(format!(
            "role {} cannot be its own parent",
            parent_id
        )));
    }
    Ok(())
}

impl RoleHierarchyService {
    pub fn new(
        roles: Arc<dyn RoleRepository>,
        cache: Arc<dyn CacheService>,
        closure_ttl_secs: u64,
    ) -> Self {
        Self {
            roles,
            invalidator: CacheInvalidator::new(cache.clone()),
            cache,
            closure_ttl_secs,
            mutation_lock: Mutex::new(()),
        }
    }

    /// Authoritative read; missing and soft-deleted roles are NotFound
    async fn load_role(&self, ctx: &RequestContext, role_id: &str) -> Result<Role> {
        match ctx.call(self.roles.get_by_id(role_id)).await? {
            Some(role) if !role.is_deleted() => Ok(role),
            _ => Err(AuthzError::NotFound(format!("role {}", role_id))),
        }
    }

    /// Cached role read used on the evaluation path
    pub async fn get_role(&self, ctx: &RequestContext, role_id: &str) -> Result<Option<Role>> {
        let key = role_key(role_id);
        if let Some(role) = ctx.call(get_json::<Role>(&*self.cache, &key)).await? {
            return Ok(Some(role));
        }

        let fence = CacheFence::observe(ctx, &*self.cache, [role_generation_key(role_id)]).await?;
        let role = ctx.call(self.roles.get_by_id(role_id)).await?;
        if let Some(role) = &role {
            fence
                .fill(ctx, &*self.cache, &key, role, self.closure_ttl_secs)
                .await?;
        }
        Ok(role)
    }

    async fn ensure_no_cycle(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<()> {
        let mut walk = AncestorWalk::new(child_id);
        let mut current = Some(parent_id.to_string());

        while let Some(role_id) = current {
            if !walk.visit(&role_id)? {
                break;
            }
            current = ctx
                .call(self.roles.get_by_id(&role_id))
                .await?
                .and_then(|role| role.parent_id);
        }
        Ok(())
    }

    /// Ids of every ancestor of `role_id`, nearest first
    pub async fn ancestors(&self, ctx: &RequestContext, role_id: &str) -> Result<Vec<RoleId>> {
        let mut ancestors = Vec::new();
        let mut visited = HashSet::from([role_id.to_string()]);
        let mut current = ctx
            .call(self.roles.get_by_id(role_id))
            .await?
            .and_then(|role| role.parent_id);

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!(role_id = %id, "Existing cycle in role hierarchy");
                break;
            }
            current = ctx
                .call(self.roles.get_by_id(&id))
                .await?
                .and_then(|role| role.parent_id);
            ancestors.push(id);
        }
        Ok(ancestors)
    }

    async fn invalidate_lineage(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<()> {
        let ancestors = self.ancestors(ctx, parent_id).await?;
        let lineage = [child_id, parent_id]
            .into_iter()
            .chain(ancestors.iter().map(String::as_str));
        self.invalidator.role_lineage(ctx, lineage).await
    }

    /// Make `child_id` a child of `parent_id`.
    ///
    /// # Errors
    ///
    /// - `Validation` for empty ids or a self-edge
    /// - `NotFound` if either role is missing or deleted
    /// - `Conflict` if the child already has a parent
    /// - `CircularDependency` if `child_id` is an ancestor of `parent_id`
    pub async fn add_child_role(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<Role> {
        validate_edge(parent_id, child_id)?;
        let _guard = ctx.run(async { Ok(self.mutation_lock.lock().await) }).await?;

        let parent = self.load_role(ctx, parent_id).await?;
        let child = self.load_role(ctx, child_id).await?;

        if let Some(existing) = &child.parent_id {
            return Err(AuthzError::Conflict(if existing == &parent.id {
                format!("role {} is already a child of {}", child.id, parent.id)
            } else {
                format!("role {} already has parent {}", child.id, existing)
            }));
        }

        self.ensure_no_cycle(ctx, &parent.id, &child.id).await?;

        let mut updated = child;
        updated.parent_id = Some(parent.id.clone());
        let stored = ctx.call(self.roles.update(updated)).await?;

        self.invalidate_lineage(ctx, parent_id, child_id).await?;

        info!(parent = %parent_id, child = %child_id, "Added child role");
        Ok(stored)
    }

    /// Detach `child_id` from `parent_id`.
    ///
    /// `Conflict` unless the child's current parent is `parent_id`.
    pub async fn remove_child_role(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
        child_id: &str,
    ) -> Result<Role> {
        validate_edge(parent_id, child_id)?;
        let _guard = ctx.run(async { Ok(self.mutation_lock.lock().await) }).await?;

        let child = self.load_role(ctx, child_id).await?;
        if child.parent_id.as_deref() != Some(parent_id) {
            return Err(AuthzError::Conflict(format!(
                "role {} is not a child of {}",
                child_id, parent_id
            )));
        }

        let mut updated = child;
        updated.parent_id = None;
        let stored = ctx.call(self.roles.update(updated)).await?;

        self.invalidate_lineage(ctx, parent_id, child_id).await?;

        info!(parent = %parent_id, child = %child_id, "Removed child role");
        Ok(stored)
    }

    /// Every non-deleted role as a forest, roots and children ordered by name
    pub async fn get_role_hierarchy(&self, ctx: &RequestContext) -> Result<Vec<RoleNode>> {
        let roles: Vec<Role> = ctx
            .call(self.roles.get_all())
            .await?
            .into_iter()
            .filter(|role| !role.is_deleted())
            .collect();

        Ok(assemble_forest(roles))
    }

    /// A role with its full descendant subtree
    pub async fn get_role_with_children(
        &self,
        ctx: &RequestContext,
        role_id: &str,
    ) -> Result<RoleNode> {
        let root = self.load_role(ctx, role_id).await?;

        let mut seen = HashSet::from([root.id.clone()]);
        let mut queue = VecDeque::from([root.id.clone()]);
        let mut subtree = vec![root];

        while let Some(id) = queue.pop_front() {
            for child in ctx.call(self.roles.get_child_roles(&id)).await? {
                if child.is_deleted() || !seen.insert(child.id.clone()) {
                    continue;
                }
                queue.push_back(child.id.clone());
                subtree.push(child);
            }
        }

        assemble_forest(subtree)
            .into_iter()
            .find(|node| node.item.id == role_id)
            .ok_or_else(|| AuthzError::internal(format!("subtree of role {} lost its root", role_id)))
    }

    /// Usable descendants of `role_id` (excluding the role itself).
    /// Cached under `role:{id}:descendants`.
    pub async fn descendant_role_ids(
        &self,
        ctx: &RequestContext,
        role_id: &str,
    ) -> Result<Vec<RoleId>> {
        let key = role_descendants_key(role_id);
        if let Some(cached) = ctx.call(get_json::<Vec<RoleId>>(&*self.cache, &key)).await? {
            return Ok(cached);
        }

        let fence = CacheFence::observe(ctx, &*self.cache, [role_generation_key(role_id)]).await?;
        let mut descendants = Vec::new();
        let mut seen = HashSet::from([role_id.to_string()]);
        let mut queue = VecDeque::from([role_id.to_string()]);

        while let Some(id) = queue.pop_front() {
            for child in ctx.call(self.roles.get_child_roles(&id)).await? {
                if !child.is_usable() || !seen.insert(child.id.clone()) {
                    continue;
                }
                queue.push_back(child.id.clone());
                descendants.push(child.id);
            }
        }
        descendants.sort();

        fence
            .fill(ctx, &*self.cache, &key, &descendants, self.closure_ttl_secs)
            .await?;
        debug!(role_id = %role_id, count = descendants.len(), "Computed role descendants");
        Ok(descendants)
    }

    /// The role plus its usable descendants; empty if the role itself is
    /// missing, inactive or deleted
    pub async fn role_closure(&self, ctx: &RequestContext, role_id: &str) -> Result<Vec<RoleId>> {
        match self.get_role(ctx, role_id).await? {
            Some(role) if role.is_usable() => {
                let mut closure = vec![role.id];
                closure.extend(self.descendant_role_ids(ctx, role_id).await?);
                Ok(closure)
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::store::MemoryStore;

    async fn service_with(roles: Vec<Role>) -> (RoleHierarchyService, Arc<MemoryStore>, Arc<InMemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        for role in roles {
            store.put_role(role).await;
        }
        let cache = Arc::new(InMemoryCache::default());
        let service = RoleHierarchyService::new(store.clone(), cache.clone(), 900);
        (service, store, cache)
    }

    #[tokio::test]
    async fn test_add_child_role() {
        let (service, _, _) =
            service_with(vec![Role::new("admin", "Admin"), Role::new("editor", "Editor")]).await;
        let ctx = RequestContext::background();

        let child = service.add_child_role(&ctx, "admin", "editor").await.unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("admin"));
        assert_eq!(child.version, 1);
    }

    #[tokio::test]
    async fn test_add_child_role_validation() {
        let (service, _, _) = service_with(vec![Role::new("admin", "Admin")]).await;
        let ctx = RequestContext::background();

        assert!(matches!(
            service.add_child_role(&ctx, "admin", "admin").await,
            Err(AuthzError::Validation(_))
        ));
        assert!(matches!(
            service.add_child_role(&ctx, "", "admin").await,
            Err(AuthzError::Validation(_))
        ));
        assert!(matches!(
            service.add_child_role(&ctx, "admin", "ghost").await,
            Err(AuthzError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_second_parent_is_conflict() {
        let (service, _, _) = service_with(vec![
            Role::new("a", "A"),
            Role::new("b", "B"),
            Role::new("c", "C").with_parent("a"),
        ])
        .await;
        let ctx = RequestContext::background();

        let result = service.add_child_role(&ctx, "b", "c").await;
        assert!(matches!(result, Err(AuthzError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_with_path() {
        let (service, _, _) = service_with(vec![
            Role::new("a", "A"),
            Role::new("b", "B").with_parent("a"),
            Role::new("c", "C").with_parent("b"),
        ])
        .await;
        let ctx = RequestContext::background();

        match service.add_child_role(&ctx, "c", "a").await {
            Err(AuthzError::CircularDependency(path)) => assert_eq!(path, "a -> c -> b -> a"),
            other => panic!("expected cycle rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_child_role() {
        let (service, _, _) =
            service_with(vec![Role::new("a", "A"), Role::new("b", "B").with_parent("a")]).await;
        let ctx = RequestContext::background();

        assert!(matches!(
            service.remove_child_role(&ctx, "x", "b").await,
            Err(AuthzError::Conflict(_))
        ));

        let child = service.remove_child_role(&ctx, "a", "b").await.unwrap();
        assert!(child.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_hierarchy_excludes_deleted() {
        let mut deleted = Role::new("d", "Deleted").with_parent("a");
        deleted.deleted_at = Some(chrono::Utc::now());
        let (service, _, _) = service_with(vec![
            Role::new("a", "Admin"),
            Role::new("b", "Billing").with_parent("a"),
            deleted,
        ])
        .await;

        let forest = service
            .get_role_hierarchy(&RequestContext::background())
            .await
            .unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].size(), 2);
    }

    #[tokio::test]
    async fn test_get_role_with_children() {
        let (service, _, _) = service_with(vec![
            Role::new("a", "A"),
            Role::new("b", "B").with_parent("a"),
            Role::new("c", "C").with_parent("b"),
            Role::new("d", "D"),
        ])
        .await;

        let node = service
            .get_role_with_children(&RequestContext::background(), "b")
            .await
            .unwrap();
        assert_eq!(node.item.id, "b");
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].item.id, "c");
    }

    #[tokio::test]
    async fn test_closure_stops_at_inactive_role() {
        let (service, _, _) = service_with(vec![
            Role::new("a", "A"),
            Role::new("b", "B").with_parent("a").inactive(),
            Role::new("c", "C").with_parent("b"),
            Role::new("d", "D").with_parent("a"),
        ])
        .await;
        let ctx = RequestContext::background();

        let closure = service.role_closure(&ctx, "a").await.unwrap();
        assert_eq!(closure, vec!["a".to_string(), "d".to_string()]);
        assert!(service.role_closure(&ctx, "b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_closure_of_ancestors() {
        let (service, _, cache) = service_with(vec![
            Role::new("a", "A"),
            Role::new("b", "B").with_parent("a"),
            Role::new("c", "C"),
        ])
        .await;
        let ctx = RequestContext::background();

        assert_eq!(service.role_closure(&ctx, "a").await.unwrap().len(), 2);
        assert!(cache.get(&role_descendants_key("a")).await.unwrap().is_some());

        service.add_child_role(&ctx, "b", "c").await.unwrap();

        assert!(cache.get(&role_descendants_key("a")).await.unwrap().is_none());
        assert_eq!(service.role_closure(&ctx, "a").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_opposite_edges_keep_graph_acyclic() {
        let (service, store, _) =
            service_with(vec![Role::new("a", "A"), Role::new("b", "B")]).await;
        let service = Arc::new(service);
        let ctx = RequestContext::background();

        let (first, second) = tokio::join!(
            service.add_child_role(&ctx, "a", "b"),
            service.add_child_role(&ctx, "b", "a"),
        );
        assert!(first.is_ok() != second.is_ok());

        let a = RoleRepository::get_by_id(&*store, "a").await.unwrap().unwrap();
        let b = RoleRepository::get_by_id(&*store, "b").await.unwrap().unwrap();
        assert!(a.parent_id.is_none() || b.parent_id.is_none());
    }
}
