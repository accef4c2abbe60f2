//! Cache key schema and push-based invalidation
//!
//! Every mutator calls into [`CacheInvalidator`] after the store write
//! succeeds. A failed invalidation is reported to the mutating caller as an
//! internal error; the TTL bounds staleness in the meantime.
//!
//! Each invalidation first moves a generation token (principal,
//! organization or role) and only then drops the affected entries. Readers
//! fill the cache through a [`CacheFence`] taken before they touch the
//! store, so a value computed from pre-mutation state is never left behind
//! by a fill that raced the invalidation.

use crate::cache::{set_json, CacheService};
use crate::context::RequestContext;
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub fn effective_roles_key(organization_id: &str, principal_id: &str) -> String {
    format!("org:{}:user:{}:effective_roles", organization_id, principal_id)
}

pub fn organization_sweep_pattern(organization_id: &str) -> String {
    format!("org:{}:user:*:effective_roles", organization_id)
}

pub fn principal_sweep_pattern(principal_id: &str) -> String {
    format!("org:*:user:{}:effective_roles", principal_id)
}

pub fn principal_organizations_key(principal_id: &str) -> String {
    format!("user:{}:organizations", principal_id)
}

pub fn role_key(role_id: &str) -> String {
    format!("role:{}", role_id)
}

pub fn role_permissions_key(role_id: &str) -> String {
    format!("role:{}:permissions", role_id)
}

pub fn role_descendants_key(role_id: &str) -> String {
    format!("role:{}:descendants", role_id)
}

pub fn principal_generation_key(principal_id: &str) -> String {
    format!("gen:user:{}", principal_id)
}

pub fn organization_generation_key(organization_id: &str) -> String {
    format!("gen:org:{}", organization_id)
}

pub fn role_generation_key(role_id: &str) -> String {
    format!("gen:role:{}", role_id)
}

/// Generation tokens observed before a value was computed
#[derive(Debug, Clone)]
pub struct CacheFence {
    observed: Vec<(String, Option<Value>)>,
}

impl CacheFence {
    /// Read the current tokens of `generation_keys`
    pub async fn observe<I>(
        ctx: &RequestContext,
        cache: &dyn CacheService,
        generation_keys: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut observed = Vec::new();
        for key in generation_keys {
            let token = ctx.call(cache.get(&key)).await?;
            observed.push((key, token));
        }
        Ok(Self { observed })
    }

    async fn moved(&self, ctx: &RequestContext, cache: &dyn CacheService) -> Result<bool> {
        for (key, token) in &self.observed {
            if ctx.call(cache.get(key)).await? != *token {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Store `value` under `key` unless a generation moved since
    /// [`CacheFence::observe`]. Returns whether the entry was kept.
    pub async fn fill<T>(
        &self,
        ctx: &RequestContext,
        cache: &dyn CacheService,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<bool>
    where
        T: Serialize + ?Sized,
    {
        if self.moved(ctx, cache).await? {
            debug!(key = %key, "Skipping cache fill raced by invalidation");
            return Ok(false);
        }

        ctx.call(set_json(cache, key, value, ttl_secs)).await?;

        // A bump landing between the check and the write
        if self.moved(ctx, cache).await? {
            ctx.call(cache.delete(key)).await?;
            debug!(key = %key, "Dropped cache fill raced by invalidation");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Deletes cache entries affected by a mutation
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn CacheService>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn CacheService>) -> Self {
        Self { cache }
    }

    async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.call(self.cache.delete(key)).await
    }

    /// Replace a generation token; never expires
    async fn bump(&self, ctx: &RequestContext, generation_key: &str) -> Result<()> {
        let token = Value::String(Uuid::new_v4().to_string());
        ctx.call(self.cache.set(generation_key, token, 0)).await
    }

    /// Delete every key matching `pattern`; returns the number removed
    pub async fn sweep(&self, ctx: &RequestContext, pattern: &str) -> Result<usize> {
        let keys = ctx.call(self.cache.keys(pattern)).await?;
        for key in &keys {
            self.delete(ctx, key).await?;
        }
        debug!(pattern = %pattern, removed = keys.len(), "Cache sweep");
        Ok(keys.len())
    }

    /// A principal's memberships or assignments changed inside one organization
    pub async fn principal(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
        principal_id: &str,
    ) -> Result<()> {
        self.bump(ctx, &principal_generation_key(principal_id)).await?;
        self.delete(ctx, &effective_roles_key(organization_id, principal_id))
            .await?;
        self.delete(ctx, &principal_organizations_key(principal_id))
            .await
    }

    /// A principal's organization-independent assignments changed
    pub async fn principal_everywhere(&self, ctx: &RequestContext, principal_id: &str) -> Result<()> {
        self.bump(ctx, &principal_generation_key(principal_id)).await?;
        self.sweep(ctx, &principal_sweep_pattern(principal_id)).await?;
        self.delete(ctx, &principal_organizations_key(principal_id))
            .await
    }

    /// Group structure or grants changed: every principal in the organization
    pub async fn organization(&self, ctx: &RequestContext, organization_id: &str) -> Result<()> {
        self.bump(ctx, &organization_generation_key(organization_id))
            .await?;
        self.sweep(ctx, &organization_sweep_pattern(organization_id))
            .await
            .map(|_| ())
    }

    /// Role tree changed: drop entry, permission and closure keys of each role
    pub async fn role_lineage<'a, I>(&self, ctx: &RequestContext, role_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for role_id in role_ids {
            self.bump(ctx, &role_generation_key(role_id)).await?;
            self.delete(ctx, &role_key(role_id)).await?;
            self.delete(ctx, &role_permissions_key(role_id)).await?;
            self.delete(ctx, &role_descendants_key(role_id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use serde_json::json;

    #[tokio::test]
    async fn test_organization_sweep_is_scoped() {
        let cache = Arc::new(InMemoryCache::default());
        for (org, user) in [("o1", "a"), ("o1", "b"), ("o2", "a")] {
            cache
                .set(&effective_roles_key(org, user), json!([]), 300)
                .await
                .unwrap();
        }

        let invalidator = CacheInvalidator::new(cache.clone());
        let ctx = RequestContext::background();
        invalidator.organization(&ctx, "o1").await.unwrap();

        assert_eq!(cache.keys("org:*").await.unwrap().len(), 1);
        assert!(cache.get(&effective_roles_key("o2", "a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_principal_everywhere() {
        let cache = Arc::new(InMemoryCache::default());
        cache.set(&effective_roles_key("o1", "a"), json!([]), 300).await.unwrap();
        cache.set(&effective_roles_key("o2", "a"), json!([]), 300).await.unwrap();
        cache.set(&effective_roles_key("o2", "b"), json!([]), 300).await.unwrap();
        cache.set(&principal_organizations_key("a"), json!(["o1"]), 300).await.unwrap();

        let invalidator = CacheInvalidator::new(cache.clone());
        invalidator
            .principal_everywhere(&RequestContext::background(), "a")
            .await
            .unwrap();

        assert_eq!(cache.keys("org:*").await.unwrap().len(), 1);
        assert!(cache.get(&principal_organizations_key("a")).await.unwrap().is_none());
        assert!(cache.get(&effective_roles_key("o2", "b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_role_lineage() {
        let cache = Arc::new(InMemoryCache::default());
        cache.set(&role_permissions_key("r1"), json!([]), 900).await.unwrap();
        cache.set(&role_descendants_key("r1"), json!([]), 900).await.unwrap();
        cache.set(&role_descendants_key("r2"), json!([]), 900).await.unwrap();

        let invalidator = CacheInvalidator::new(cache.clone());
        invalidator
            .role_lineage(&RequestContext::background(), ["r1"])
            .await
            .unwrap();

        assert_eq!(cache.keys("role:*").await.unwrap(), vec![role_descendants_key("r2")]);
        assert!(cache.get(&role_generation_key("r1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fence_keeps_fill_without_invalidation() {
        let cache = InMemoryCache::default();
        let ctx = RequestContext::background();
        let fence = CacheFence::observe(&ctx, &cache, [principal_generation_key("a")])
            .await
            .unwrap();

        let kept = fence
            .fill(&ctx, &cache, &effective_roles_key("o1", "a"), &json!(["viewer"]), 300)
            .await
            .unwrap();

        assert!(kept);
        assert!(cache.get(&effective_roles_key("o1", "a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fence_rejects_fill_after_invalidation() {
        let cache = Arc::new(InMemoryCache::default());
        let ctx = RequestContext::background();
        let invalidator = CacheInvalidator::new(cache.clone());

        // first invalidation creates the token, the second replaces it
        for _ in 0..2 {
            let fence = CacheFence::observe(
                &ctx,
                &*cache,
                [principal_generation_key("a"), organization_generation_key("o1")],
            )
            .await
            .unwrap();

            invalidator.principal(&ctx, "o1", "a").await.unwrap();

            let kept = fence
                .fill(&ctx, &*cache, &effective_roles_key("o1", "a"), &json!(["stale"]), 300)
                .await
                .unwrap();
            assert!(!kept);
            assert!(cache.get(&effective_roles_key("o1", "a")).await.unwrap().is_none());
        }

        let fence = CacheFence::observe(&ctx, &*cache, [organization_generation_key("o1")])
            .await
            .unwrap();
        invalidator.organization(&ctx, "o1").await.unwrap();
        assert!(!fence
            .fill(&ctx, &*cache, &effective_roles_key("o1", "b"), &json!([]), 300)
            .await
            .unwrap());
    }
}
