//! Authorization evaluator
//!
//! Resolves the principal's effective roles across its organizations, expands
//! each role through the role hierarchy and matches the requested access
//! against the resulting permissions. No matching permission means deny.
//!
//! ```text
//! check → organizations → effective roles → role closure → permissions → match
//!              ↓                 ↓                ↓              ↓          ↓
//!           [Cache] ──────────────────────────────────────────────┘   allow / deny
//!                                                                         ↓
//!                                                               [Audit] [Metrics]
//! ```
//!
//! Any store or cache failure surfaces as an indeterminate error rather than
//! a decision.

pub mod decision;
pub mod endpoint;
pub mod metrics;

pub use decision::{
    BulkCheckResult, Decision, DecisionReason, PermissionCheck, DENIED_MESSAGE,
};
pub use endpoint::{EndpointPermissionMap, EndpointRule, RequiredPermission};
pub use metrics::{EngineMetrics, MetricsCollector};

use crate::audit::AuditService;
use crate::cache::{get_json, CacheService};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::error::{AuthzError, Result};
use crate::hierarchy::RoleHierarchyService;
use crate::inheritance::{union_effective_roles, OrganizationalContextProvider, RoleInheritanceEngine};
use crate::invalidation::{role_generation_key, role_permissions_key, CacheFence};
use crate::store::PermissionRepository;
use crate::types::{EffectiveRole, Permission};
use futures::future::{join_all, try_join_all};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Main authorization engine
pub struct AuthzEngine {
    org_context: Arc<dyn OrganizationalContextProvider>,
    inheritance: Arc<RoleInheritanceEngine>,
    hierarchy: Arc<RoleHierarchyService>,
    permissions: Arc<dyn PermissionRepository>,
    cache: Arc<dyn CacheService>,
    audit: Arc<dyn AuditService>,
    endpoints: EndpointPermissionMap,
    metrics: Option<Arc<MetricsCollector>>,
    audit_tasks: TaskTracker,
    config: EngineConfig,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AuthzError::Validation(format!("{} is required", what)));
    }
    Ok(())
}

impl AuthzEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        org_context: Arc<dyn OrganizationalContextProvider>,
        inheritance: Arc<RoleInheritanceEngine>,
        hierarchy: Arc<RoleHierarchyService>,
        permissions: Arc<dyn PermissionRepository>,
        cache: Arc<dyn CacheService>,
        audit: Arc<dyn AuditService>,
        config: EngineConfig,
    ) -> Result<Self> {
        let endpoints = EndpointPermissionMap::new(
            config.endpoint_rules.clone(),
            config.path_convention_fallback,
        )?;

        let metrics = config
            .enable_metrics
            .then(|| Arc::new(MetricsCollector::new()));

        info!(
            "AuthzEngine initialized with endpoint_rules={}, convention_fallback={}, audit={}, metrics={}",
            endpoints.len(),
            config.path_convention_fallback,
            config.audit_denials,
            config.enable_metrics
        );

        Ok(Self {
            org_context,
            inheritance,
            hierarchy,
            permissions,
            cache,
            audit,
            endpoints,
            metrics,
            audit_tasks: TaskTracker::new(),
            config,
        })
    }

    /// Metrics snapshot, if metrics are enabled
    pub async fn metrics(&self) -> Option<EngineMetrics> {
        match &self.metrics {
            Some(metrics) => Some(metrics.get_metrics().await),
            None => None,
        }
    }

    /// Wait for every audit record spawned so far to be written. Callers
    /// must not flush concurrently.
    pub async fn flush_audit(&self) {
        self.audit_tasks.close();
        self.audit_tasks.wait().await;
        self.audit_tasks.reopen();
    }

    /// Decide whether `principal_id` may perform `action` on `resource`
    /// (optionally a single instance of it).
    ///
    /// # Errors
    ///
    /// - `Validation` for empty principal, resource or action
    /// - `Internal`, `Cancelled`, `DeadlineExceeded` when the outcome cannot
    ///   be determined; these are never a decision
    pub async fn check_permission(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        resource: &str,
        resource_id: Option<&str>,
        action: &str,
    ) -> Result<Decision> {
        let resource_path = match resource_id {
            Some(id) => format!("{}/{}", resource, id),
            None => resource.to_string(),
        };
        self.check_recorded(ctx, principal_id, resource, resource_id, action, &resource_path)
            .await
    }

    async fn check_recorded(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        resource: &str,
        resource_id: Option<&str>,
        action: &str,
        resource_path: &str,
    ) -> Result<Decision> {
        let start = Instant::now();
        let ctx = ctx.clone().bounded(self.config.request_timeout);

        debug!(
            "Permission check: principal={}, resource={}, resource_id={:?}, action={}",
            principal_id, resource, resource_id, action
        );

        let result = self
            .evaluate(&ctx, principal_id, resource, resource_id, action)
            .await;

        match &result {
            Ok(decision) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_decision(decision.allowed, start.elapsed()).await;
                }
                if decision.allowed {
                    debug!(
                        principal = %principal_id,
                        granted_by = ?decision.granted_by,
                        "Access allowed"
                    );
                } else {
                    let detail = decision
                        .reason
                        .as_ref()
                        .map(DecisionReason::describe)
                        .unwrap_or_else(|| DENIED_MESSAGE.to_string());
                    self.spawn_denial_audit(principal_id, action, resource, resource_path, detail);
                }
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(start.elapsed()).await;
                }
                warn!(principal = %principal_id, "Permission check failed: {}", err);
            }
        }

        result
    }

    async fn evaluate(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        resource: &str,
        resource_id: Option<&str>,
        action: &str,
    ) -> Result<Decision> {
        require(principal_id, "principal id")?;
        require(resource, "resource")?;
        require(action, "action")?;

        let roles = self.resolve_roles(ctx, principal_id).await?;
        if roles.is_empty() {
            return Ok(Decision::deny(DecisionReason::NoRoles));
        }

        let mut expanded = HashSet::new();
        for role in &roles {
            for member in self.hierarchy.role_closure(ctx, &role.role_id).await? {
                if !expanded.insert(member.clone()) {
                    continue;
                }
                let permissions = self.role_permissions(ctx, &member).await?;
                if permissions
                    .iter()
                    .any(|p| p.matches(resource, resource_id, action))
                {
                    debug!(role = %role.role_id, via = %member, "Matching permission found");
                    return Ok(Decision::allow(role.role_id.clone()));
                }
            }
        }

        Ok(Decision::deny(DecisionReason::NoMatchingPermission))
    }

    /// Effective roles across every organization the principal acts in.
    /// Principals without an organization are evaluated on their
    /// organization-independent direct roles.
    pub async fn resolve_roles(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Vec<EffectiveRole>> {
        let organizations = self.org_context.organizations_for(ctx, principal_id).await?;
        if organizations.is_empty() {
            return self.inheritance.global_direct_roles(ctx, principal_id).await;
        }

        let per_org = organizations.iter().map(|org| async move {
            match self
                .inheritance
                .calculate_effective_roles(ctx, org, principal_id)
                .await
            {
                Err(AuthzError::NotFound(what)) => {
                    warn!(org = %org, "Skipping organization: {}", what);
                    Ok(Vec::new())
                }
                other => other,
            }
        });

        Ok(union_effective_roles(try_join_all(per_org).await?))
    }

    /// Permissions attached directly to a role, cached under
    /// `role:{id}:permissions`
    async fn role_permissions(&self, ctx: &RequestContext, role_id: &str) -> Result<Vec<Permission>> {
        let key = role_permissions_key(role_id);
        if let Some(cached) = ctx
            .call(get_json::<Vec<Permission>>(&*self.cache, &key))
            .await?
        {
            return Ok(cached);
        }

        let fence = CacheFence::observe(ctx, &*self.cache, [role_generation_key(role_id)]).await?;
        let permissions = ctx.call(self.permissions.get_by_role_id(role_id)).await?;
        fence
            .fill(ctx, &*self.cache, &key, &permissions, self.config.closure_ttl_secs)
            .await?;
        Ok(permissions)
    }

    fn spawn_denial_audit(
        &self,
        principal_id: &str,
        action: &str,
        resource: &str,
        resource_path: &str,
        detail: String,
    ) {
        if !self.config.audit_denials {
            return;
        }

        let audit = self.audit.clone();
        let principal_id = principal_id.to_string();
        let action = action.to_string();
        let resource = resource.to_string();
        let resource_path = resource_path.to_string();

        self.audit_tasks.spawn(async move {
            if let Err(e) = audit
                .log_access_denied(&principal_id, &action, &resource, &resource_path, &detail)
                .await
            {
                warn!(principal = %principal_id, "Failed to record access denial: {}", e);
            }
        });
    }

    fn spawn_security_event(&self, principal_id: &str, event_type: &str, path: &str, details: serde_json::Value) {
        let audit = self.audit.clone();
        let principal_id = principal_id.to_string();
        let event_type = event_type.to_string();
        let path = path.to_string();

        self.audit_tasks.spawn(async move {
            if let Err(e) = audit
                .log_security_event(&principal_id, &event_type, &path, false, details)
                .await
            {
                warn!(principal = %principal_id, "Failed to record security event: {}", e);
            }
        });
    }

    /// Decide access to an HTTP endpoint. An endpoint with no mapping is
    /// denied and reported as a security event.
    pub async fn validate_api_endpoint_access(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        method: &str,
        path: &str,
    ) -> Result<bool> {
        require(principal_id, "principal id")?;

        let Some(required) = self.endpoints.resolve(method, path) else {
            warn!(principal = %principal_id, method = %method, path = %path, "Unmapped endpoint");
            self.spawn_security_event(
                principal_id,
                "unmapped_endpoint",
                path,
                json!({ "method": method }),
            );
            return Ok(false);
        };

        let decision = self
            .check_recorded(
                ctx,
                principal_id,
                &required.resource,
                required.resource_id.as_deref(),
                &required.action,
                path,
            )
            .await?;
        Ok(decision.allowed)
    }

    /// Evaluate several checks for one principal concurrently. Each item
    /// carries its own result; an error in one does not affect the others.
    pub async fn check_bulk_permissions(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
        checks: Vec<PermissionCheck>,
    ) -> Vec<BulkCheckResult> {
        let evaluations = checks.into_iter().map(|check| async move {
            let result = self
                .check_permission(
                    ctx,
                    principal_id,
                    &check.resource,
                    check.resource_id.as_deref(),
                    &check.action,
                )
                .await;
            BulkCheckResult { check, result }
        });

        join_all(evaluations).await
    }

    /// Distinct `resource:action` strings the principal holds, sorted
    pub async fn get_principal_permissions(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Vec<String>> {
        require(principal_id, "principal id")?;
        let ctx = ctx.clone().bounded(self.config.request_timeout);

        let mut expanded = HashSet::new();
        let mut keys = BTreeSet::new();
        for role in self.resolve_roles(&ctx, principal_id).await? {
            for member in self.hierarchy.role_closure(&ctx, &role.role_id).await? {
                if !expanded.insert(member.clone()) {
                    continue;
                }
                for permission in self.role_permissions(&ctx, &member).await? {
                    keys.insert(permission.key());
                }
            }
        }

        Ok(keys.into_iter().collect())
    }
}
