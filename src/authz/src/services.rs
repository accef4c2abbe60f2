//! Service wiring over a single store

use crate::audit::AuditService;
use crate::cache::CacheService;
use crate::config::EngineConfig;
use crate::engine::AuthzEngine;
use crate::error::Result;
use crate::hierarchy::{GroupService, RoleHierarchyService};
use crate::inheritance::{MembershipOrganizationProvider, RoleInheritanceEngine};
use crate::store::AuthzStore;
use std::sync::Arc;

/// Every service sharing one store, cache and audit sink
#[derive(Clone)]
pub struct AuthzServices {
    pub roles: Arc<RoleHierarchyService>,
    pub groups: Arc<GroupService>,
    pub inheritance: Arc<RoleInheritanceEngine>,
    pub engine: Arc<AuthzEngine>,
}

impl AuthzServices {
    pub fn new<S>(
        store: Arc<S>,
        cache: Arc<dyn CacheService>,
        audit: Arc<dyn AuditService>,
        config: EngineConfig,
    ) -> Result<Self>
    where
        S: AuthzStore + 'static,
    {
        let roles = Arc::new(RoleHierarchyService::new(
            store.clone(),
            cache.clone(),
            config.closure_ttl_secs,
        ));

        let groups = Arc::new(GroupService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            cache.clone(),
        ));

        let inheritance = Arc::new(RoleInheritanceEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            groups.clone(),
            cache.clone(),
            config.effective_roles_ttl_secs,
        ));

        let org_context = Arc::new(MembershipOrganizationProvider::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            cache.clone(),
            config.organizations_ttl_secs,
        ));

        let engine = Arc::new(AuthzEngine::new(
            org_context,
            inheritance.clone(),
            roles.clone(),
            store,
            cache,
            audit,
            config,
        )?);

        Ok(Self {
            roles,
            groups,
            inheritance,
            engine,
        })
    }
}
