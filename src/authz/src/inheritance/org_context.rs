//! Organizations a principal acts in

use crate::cache::{get_json, CacheService};
use crate::context::RequestContext;
use crate::error::Result;
use crate::invalidation::{principal_generation_key, principal_organizations_key, CacheFence};
use crate::store::{
    GroupMembershipRepository, GroupRepository, OrganizationRepository, RoleAssignmentRepository,
};
use crate::types::{next_boundary, OrganizationId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Default TTL for a principal's organization list (seconds)
pub const ORGANIZATIONS_TTL_SECS: u64 = 300;

/// Supplies the organizations whose effective roles are evaluated for a
/// principal
#[async_trait]
pub trait OrganizationalContextProvider: Send + Sync {
    async fn organizations_for(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Vec<OrganizationId>>;
}

/// Derives organizations from effective group memberships and
/// organization-scoped direct assignments. Inactive or deleted organizations
/// are left out.
pub struct MembershipOrganizationProvider {
    memberships: Arc<dyn GroupMembershipRepository>,
    groups: Arc<dyn GroupRepository>,
    assignments: Arc<dyn RoleAssignmentRepository>,
    organizations: Arc<dyn OrganizationRepository>,
    cache: Arc<dyn CacheService>,
    ttl_secs: u64,
}

impl MembershipOrganizationProvider {
    pub fn new(
        memberships: Arc<dyn GroupMembershipRepository>,
        groups: Arc<dyn GroupRepository>,
        assignments: Arc<dyn RoleAssignmentRepository>,
        organizations: Arc<dyn OrganizationRepository>,
        cache: Arc<dyn CacheService>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            memberships,
            groups,
            assignments,
            organizations,
            cache,
            ttl_secs,
        }
    }
}

#[async_trait]
impl OrganizationalContextProvider for MembershipOrganizationProvider {
    async fn organizations_for(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Vec<OrganizationId>> {
        let key = principal_organizations_key(principal_id);
        if let Some(cached) = ctx
            .call(get_json::<Vec<OrganizationId>>(&*self.cache, &key))
            .await?
        {
            return Ok(cached);
        }

        let fence =
            CacheFence::observe(ctx, &*self.cache, [principal_generation_key(principal_id)]).await?;

        let now = Utc::now();
        let mut candidates = BTreeSet::new();
        let mut next_change = None;

        for membership in ctx
            .call(self.memberships.get_by_principal_id(principal_id))
            .await?
            .into_iter()
            .filter(|m| m.is_active)
        {
            if let Some(at) = next_boundary(membership.effective_from, membership.effective_to, now) {
                next_change = next_change.into_iter().chain(Some(at)).min();
            }
            if !membership.is_effective(now) {
                continue;
            }
            if let Some(group) = ctx.call(self.groups.get_by_id(&membership.group_id)).await? {
                if group.is_usable() {
                    candidates.insert(group.organization_id);
                }
            }
        }

        for assignment in ctx
            .call(self.assignments.get_by_principal_id(principal_id))
            .await?
        {
            if let (true, Some(org)) = (assignment.is_active, assignment.organization_id) {
                candidates.insert(org);
            }
        }

        let mut organizations = Vec::new();
        for org_id in candidates {
            if let Some(org) = ctx.call(self.organizations.get_by_id(&org_id)).await? {
                if org.is_usable() {
                    organizations.push(org_id);
                }
            }
        }

        let ttl = next_change
            .map(|at| ((at - now).num_seconds().max(1) as u64).min(self.ttl_secs))
            .unwrap_or(self.ttl_secs);
        fence
            .fill(ctx, &*self.cache, &key, &organizations, ttl)
            .await?;

        debug!(principal = %principal_id, organizations = ?organizations, "Resolved organizations");
        Ok(organizations)
    }
}
