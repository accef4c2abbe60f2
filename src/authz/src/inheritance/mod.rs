//! Role inheritance engine
//!
//! A principal's effective roles inside an organization are its direct role
//! assignments plus the roles granted to its groups. A member of group G
//! inherits grants made on G and on every ancestor of G; the distance of an
//! inherited role is the number of hops from G to the granting group.
//!
//! When the same role is reachable several ways the direct assignment wins,
//! then the smaller distance, then the lexicographically smaller source
//! group id, so results are deterministic for a given store state and time.

pub mod org_context;

pub use org_context::{MembershipOrganizationProvider, OrganizationalContextProvider};

use crate::cache::{get_json, CacheService};
use crate::context::RequestContext;
use crate::error::{AuthzError, Result};
use crate::hierarchy::GroupService;
use crate::invalidation::{
    effective_roles_key, organization_generation_key, principal_generation_key, CacheFence,
    CacheInvalidator,
};
use crate::store::{GroupRoleRepository, OrganizationRepository, RoleAssignmentRepository, RoleRepository};
use crate::types::{next_boundary, EffectiveRole, Role, RoleAssignment, RoleId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default TTL for cached effective roles (seconds)
pub const EFFECTIVE_ROLES_TTL_SECS: u64 = 300;

/// Effective roles plus the earliest time at which a window bound flips
struct Resolution {
    roles: Vec<EffectiveRole>,
    next_change: Option<DateTime<Utc>>,
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Ordering key: direct first, then distance, then role id
fn precedence(role: &EffectiveRole) -> (bool, u32, &str) {
    (!role.is_direct, role.distance, role.role_id.as_str())
}

/// `true` if `candidate` should replace `current` for the same role id
fn outranks(candidate: &EffectiveRole, current: &EffectiveRole) -> bool {
    let key = |r: &EffectiveRole| (!r.is_direct, r.distance, r.source_group_id.clone());
    key(candidate) < key(current)
}

/// Merge direct and inherited roles. Direct entries win every collision.
/// Sorted by (direct first, distance, role id).
pub fn merge_direct_and_inherited(
    direct: Vec<EffectiveRole>,
    inherited: Vec<EffectiveRole>,
) -> Vec<EffectiveRole> {
    let mut seen = HashSet::new();
    let mut merged: Vec<EffectiveRole> = direct
        .into_iter()
        .map(|mut role| {
            role.is_direct = true;
            role.distance = 0;
            role.source_group_id = None;
            role.inheritance_path.clear();
            role
        })
        .filter(|role| seen.insert(role.role_id.clone()))
        .collect();

    merged.extend(
        inherited
            .into_iter()
            .filter(|role| seen.insert(role.role_id.clone())),
    );

    merged.sort_by(|a, b| precedence(a).cmp(&precedence(b)));
    merged
}

/// Union effective-role sets from several organizations, keeping the best
/// provenance for every role id.
pub fn union_effective_roles<I>(sets: I) -> Vec<EffectiveRole>
where
    I: IntoIterator<Item = Vec<EffectiveRole>>,
{
    let mut best: BTreeMap<RoleId, EffectiveRole> = BTreeMap::new();
    for role in sets.into_iter().flatten() {
        match best.get(&role.role_id) {
            Some(current) if !outranks(&role, current) => {}
            _ => {
                best.insert(role.role_id.clone(), role);
            }
        }
    }

    let mut roles: Vec<EffectiveRole> = best.into_values().collect();
    roles.sort_by(|a, b| precedence(a).cmp(&precedence(b)));
    roles
}

pub struct RoleInheritanceEngine {
    organizations: Arc<dyn OrganizationRepository>,
    assignments: Arc<dyn RoleAssignmentRepository>,
    roles: Arc<dyn RoleRepository>,
    grants: Arc<dyn GroupRoleRepository>,
    groups: Arc<GroupService>,
    cache: Arc<dyn CacheService>,
    invalidator: CacheInvalidator,
    ttl_secs: u64,
}

impl RoleInheritanceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organizations: Arc<dyn OrganizationRepository>,
        assignments: Arc<dyn RoleAssignmentRepository>,
        roles: Arc<dyn RoleRepository>,
        grants: Arc<dyn GroupRoleRepository>,
        groups: Arc<GroupService>,
        cache: Arc<dyn CacheService>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            organizations,
            assignments,
            roles,
            grants,
            groups,
            invalidator: CacheInvalidator::new(cache.clone()),
            cache,
            ttl_secs,
        }
    }

    /// Effective roles of a principal in an organization, cache-first.
    ///
    /// Entries live for the configured TTL, or until the next membership or
    /// grant window bound if that comes sooner.
    pub async fn calculate_effective_roles(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
        principal_id: &str,
    ) -> Result<Vec<EffectiveRole>> {
        validate_ids(organization_id, principal_id)?;

        let key = effective_roles_key(organization_id, principal_id);
        if let Some(cached) = ctx
            .call(get_json::<Vec<EffectiveRole>>(&*self.cache, &key))
            .await?
        {
            debug!(org = %organization_id, principal = %principal_id, "Effective roles cache hit");
            return Ok(cached);
        }

        let fence = CacheFence::observe(
            ctx,
            &*self.cache,
            [
                principal_generation_key(principal_id),
                organization_generation_key(organization_id),
            ],
        )
        .await?;

        let now = Utc::now();
        let resolution = self.resolve(ctx, organization_id, principal_id, now).await?;

        let ttl = match resolution.next_change {
            Some(at) => {
                let until = (at - now).num_seconds().max(1) as u64;
                until.min(self.ttl_secs)
            }
            None => self.ttl_secs,
        };
        fence
            .fill(ctx, &*self.cache, &key, &resolution.roles, ttl)
            .await?;

        Ok(resolution.roles)
    }

    /// Uncached computation at an explicit point in time
    pub async fn calculate_effective_roles_at(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
        principal_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EffectiveRole>> {
        validate_ids(organization_id, principal_id)?;
        Ok(self
            .resolve(ctx, organization_id, principal_id, now)
            .await?
            .roles)
    }

    async fn resolve(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
        principal_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let organization = ctx
            .call(self.organizations.get_by_id(organization_id))
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("organization {}", organization_id)))?;

        let mut role_cache: HashMap<RoleId, Option<Role>> = HashMap::new();

        let direct = self
            .direct_roles(
                ctx,
                principal_id,
                Some(organization_id).filter(|_| organization.is_usable()),
                &mut role_cache,
            )
            .await?;

        let (inherited, next_change) = if organization.is_usable() {
            self.inherited_roles(ctx, organization_id, principal_id, now, &mut role_cache)
                .await?
        } else {
            debug!(org = %organization_id, "Organization inactive, no inherited roles");
            (Vec::new(), None)
        };

        let roles = merge_direct_and_inherited(direct, inherited);
        debug!(
            org = %organization_id,
            principal = %principal_id,
            count = roles.len(),
            "Resolved effective roles"
        );

        Ok(Resolution { roles, next_change })
    }

    /// Whether `role_id` exists, is usable and is in scope for
    /// `organization_id`
    async fn usable_role(
        &self,
        ctx: &RequestContext,
        role_id: &str,
        organization_id: Option<&str>,
        role_cache: &mut HashMap<RoleId, Option<Role>>,
    ) -> Result<bool> {
        if !role_cache.contains_key(role_id) {
            let role = ctx.call(self.roles.get_by_id(role_id)).await?;
            role_cache.insert(role_id.to_string(), role);
        }

        match role_cache.get(role_id) {
            Some(Some(role)) if !role.is_usable_in(organization_id) => {
                debug!(role_id = %role_id, org = ?organization_id, "Skipping role outside its scope");
                Ok(false)
            }
            Some(Some(_)) => Ok(true),
            _ => {
                warn!(role_id = %role_id, "Skipping reference to missing role");
                Ok(false)
            }
        }
    }

    /// Active direct assignments. `organization_id = None` keeps only the
    /// organization-independent ones.
    async fn direct_roles(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        organization_id: Option<&str>,
        role_cache: &mut HashMap<RoleId, Option<Role>>,
    ) -> Result<Vec<EffectiveRole>> {
        let assignments = ctx
            .call(self.assignments.get_by_principal_id(principal_id))
            .await?;

        let mut direct = Vec::new();
        for assignment in assignments.into_iter().filter(|a| a.is_active) {
            let applies = match organization_id {
                Some(org) => assignment.applies_to(org),
                None => assignment.organization_id.is_none(),
            };
            if applies
                && self
                    .usable_role(ctx, &assignment.role_id, organization_id, role_cache)
                    .await?
            {
                direct.push(EffectiveRole::direct(assignment.role_id));
            }
        }
        Ok(direct)
    }

    /// Organization-independent direct roles, for principals that belong to
    /// no organization
    pub async fn global_direct_roles(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Vec<EffectiveRole>> {
        let mut role_cache = HashMap::new();
        let direct = self
            .direct_roles(ctx, principal_id, None, &mut role_cache)
            .await?;
        Ok(merge_direct_and_inherited(direct, Vec::new()))
    }

    async fn inherited_roles(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
        principal_id: &str,
        now: DateTime<Utc>,
        role_cache: &mut HashMap<RoleId, Option<Role>>,
    ) -> Result<(Vec<EffectiveRole>, Option<DateTime<Utc>>)> {
        let memberships = self.groups.get_by_principal_id(ctx, principal_id).await?;
        let mut best: BTreeMap<RoleId, EffectiveRole> = BTreeMap::new();
        let mut next_change = None;

        for membership in memberships.into_iter().filter(|m| m.is_active) {
            next_change = earliest(
                next_change,
                next_boundary(membership.effective_from, membership.effective_to, now),
            );
            if !membership.is_effective(now) {
                continue;
            }

            let Some(group) = self.groups.get_group(ctx, &membership.group_id).await? else {
                warn!(group_id = %membership.group_id, "Membership references missing group");
                continue;
            };
            if group.organization_id != organization_id {
                continue;
            }

            let chain = self.groups.ancestor_chain(ctx, group).await?;
            for (hops, granting) in chain.iter().enumerate() {
                let grants = ctx.call(self.grants.get_by_group_id(&granting.id)).await?;

                for grant in grants
                    .into_iter()
                    .filter(|g| g.is_active && g.organization_id == organization_id)
                {
                    next_change = earliest(
                        next_change,
                        next_boundary(grant.effective_from, grant.effective_to, now),
                    );
                    if !grant.is_effective(now)
                        || !self
                            .usable_role(ctx, &grant.role_id, Some(organization_id), role_cache)
                            .await?
                    {
                        continue;
                    }

                    let path = chain[..=hops].iter().map(|g| g.id.clone()).collect();
                    let candidate = EffectiveRole::inherited(grant.role_id, path);
                    match best.get(&candidate.role_id) {
                        Some(current) if !outranks(&candidate, current) => {}
                        _ => {
                            best.insert(candidate.role_id.clone(), candidate);
                        }
                    }
                }
            }
        }

        Ok((best.into_values().collect(), next_change))
    }

    /// How the principal came to hold `role_id` in the organization
    pub async fn get_role_inheritance_path(
        &self,
        ctx: &RequestContext,
        organization_id: &str,
        principal_id: &str,
        role_id: &str,
    ) -> Result<EffectiveRole> {
        self.calculate_effective_roles(ctx, organization_id, principal_id)
            .await?
            .into_iter()
            .find(|role| role.role_id == role_id)
            .ok_or_else(|| {
                AuthzError::NotFound(format!(
                    "role {} is not held by {} in organization {}",
                    role_id, principal_id, organization_id
                ))
            })
    }

    async fn invalidate_assignment(&self, ctx: &RequestContext, assignment: &RoleAssignment) -> Result<()> {
        match &assignment.organization_id {
            Some(org) => {
                self.invalidator
                    .principal(ctx, org, &assignment.principal_id)
                    .await
            }
            None => {
                self.invalidator
                    .principal_everywhere(ctx, &assignment.principal_id)
                    .await
            }
        }
    }

    /// Assign a role directly to a principal, optionally within one
    /// organization. An inactive assignment is reactivated.
    pub async fn assign_direct_role(
        &self,
        ctx: &RequestContext,
        assignment: RoleAssignment,
    ) -> Result<RoleAssignment> {
        if assignment.principal_id.trim().is_empty() || assignment.role_id.trim().is_empty() {
            return Err(AuthzError::Validation(
                "principal id and role id are required".to_string(),
            ));
        }

        match ctx.call(self.roles.get_by_id(&assignment.role_id)).await? {
            Some(role) if !role.is_deleted() => {}
            _ => return Err(AuthzError::NotFound(format!("role {}", assignment.role_id))),
        }
        if let Some(org) = &assignment.organization_id {
            if ctx.call(self.organizations.get_by_id(org)).await?.is_none() {
                return Err(AuthzError::NotFound(format!("organization {}", org)));
            }
        }

        let existing = ctx
            .call(self.assignments.get_by_principal_id(&assignment.principal_id))
            .await?
            .into_iter()
            .find(|a| a.role_id == assignment.role_id && a.organization_id == assignment.organization_id);

        let mut stored = assignment;
        stored.is_active = true;
        match existing {
            Some(current) if current.is_active => {
                return Err(AuthzError::Conflict(format!(
                    "role {} is already assigned to {}",
                    stored.role_id, stored.principal_id
                )));
            }
            Some(_) => ctx.call(self.assignments.update(stored.clone())).await?,
            None => ctx.call(self.assignments.create(stored.clone())).await?,
        }

        self.invalidate_assignment(ctx, &stored).await?;
        info!(
            principal = %stored.principal_id,
            role = %stored.role_id,
            org = ?stored.organization_id,
            "Assigned direct role"
        );
        Ok(stored)
    }

    pub async fn revoke_direct_role(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        role_id: &str,
        organization_id: Option<&str>,
    ) -> Result<()> {
        let mut assignment = ctx
            .call(self.assignments.get_by_principal_id(principal_id))
            .await?
            .into_iter()
            .find(|a| {
                a.is_active && a.role_id == role_id && a.organization_id.as_deref() == organization_id
            })
            .ok_or_else(|| {
                AuthzError::NotFound(format!(
                    "active assignment of role {} to {}",
                    role_id, principal_id
                ))
            })?;

        assignment.is_active = false;
        ctx.call(self.assignments.update(assignment.clone())).await?;

        self.invalidate_assignment(ctx, &assignment).await?;
        info!(principal = %principal_id, role = %role_id, org = ?organization_id, "Revoked direct role");
        Ok(())
    }
}

fn validate_ids(organization_id: &str, principal_id: &str) -> Result<()> {
    if organization_id.trim().is_empty() || principal_id.trim().is_empty() {
        return Err(AuthzError::Validation(
            "organization id and principal id are required".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inherited(role: &str, path: &[&str]) -> EffectiveRole {
        EffectiveRole::inherited(role, path.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_merge_direct_wins() {
        let merged = merge_direct_and_inherited(
            vec![EffectiveRole::direct("editor")],
            vec![inherited("editor", &["eng"]), inherited("viewer", &["eng", "tech"])],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], EffectiveRole::direct("editor"));
        assert_eq!(merged[1].role_id, "viewer");
        assert_eq!(merged[1].distance, 1);
    }

    #[test]
    fn test_merge_sorts_by_distance_then_id() {
        let merged = merge_direct_and_inherited(
            vec![EffectiveRole::direct("zeta")],
            vec![
                inherited("b", &["g1", "g2"]),
                inherited("c", &["g1"]),
                inherited("a", &["g1", "g2"]),
            ],
        );
        let ids: Vec<&str> = merged.iter().map(|r| r.role_id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "c", "a", "b"]);
    }

    #[test]
    fn test_union_prefers_closer_then_smaller_group() {
        let roles = union_effective_roles(vec![
            vec![inherited("viewer", &["x", "b-group"])],
            vec![inherited("viewer", &["y", "a-group"])],
            vec![inherited("viewer", &["z", "q", "c-group"])],
        ]);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].source_group_id.as_deref(), Some("a-group"));

        let roles = union_effective_roles(vec![
            vec![inherited("viewer", &["x"])],
            vec![EffectiveRole::direct("viewer")],
        ]);
        assert!(roles[0].is_direct);
    }

    #[tokio::test]
    async fn test_organization_scoped_role_stays_in_its_organization() {
        use crate::audit::MemoryAuditService;
        use crate::cache::NoopCache;
        use crate::config::EngineConfig;
        use crate::services::AuthzServices;
        use crate::store::MemoryStore;
        use crate::types::{Group, GroupMembership, GroupRole, Organization};

        let store = Arc::new(MemoryStore::new());
        store.put_organization(Organization::new("A", "Alpha")).await;
        store.put_organization(Organization::new("B", "Beta")).await;
        store.put_role(Role::new("b-auditor", "B Auditor").in_organization("B")).await;
        store.put_group(Group::new("a-staff", "A Staff", "A")).await;
        store.put_group(Group::new("b-staff", "B Staff", "B")).await;
        store.put_group_role(GroupRole::new("a-staff", "b-auditor", "A")).await;
        store.put_group_role(GroupRole::new("b-staff", "b-auditor", "B")).await;
        store.put_membership(GroupMembership::new("a-staff", "u")).await;
        store.put_membership(GroupMembership::new("b-staff", "u")).await;
        store
            .put_assignment(RoleAssignment::new("v", "b-auditor").in_organization("A"))
            .await;
        store.put_assignment(RoleAssignment::new("w", "b-auditor")).await;

        let services = AuthzServices::new(
            store,
            Arc::new(NoopCache),
            Arc::new(MemoryAuditService::new()),
            EngineConfig::default(),
        )
        .unwrap();
        let ctx = RequestContext::background();
        let inheritance = &services.inheritance;

        let in_a = inheritance.calculate_effective_roles(&ctx, "A", "u").await.unwrap();
        let in_b = inheritance.calculate_effective_roles(&ctx, "B", "u").await.unwrap();
        assert!(in_a.is_empty());
        assert_eq!(in_b.len(), 1);
        assert_eq!(in_b[0].role_id, "b-auditor");

        let direct_in_a = inheritance.calculate_effective_roles(&ctx, "A", "v").await.unwrap();
        assert!(direct_in_a.is_empty());
        assert!(inheritance.global_direct_roles(&ctx, "w").await.unwrap().is_empty());
    }
}
