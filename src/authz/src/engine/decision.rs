//! Authorization decision types

use crate::error::AuthzError;
use crate::types::RoleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-facing text for every denial. Internal detail stays in
/// [`Decision::reason`], which is never serialized.
pub const DENIED_MESSAGE: &str = "access denied";

/// A permission check request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub action: String,
}

impl PermissionCheck {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            resource_id: None,
            action: action.into(),
        }
    }

    pub fn on_instance(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }
}

/// Why the evaluator reached its decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    /// A permission of this role matched
    Granted { role_id: RoleId },
    /// The principal holds no effective roles
    NoRoles,
    /// Roles were found but none carries a matching permission
    NoMatchingPermission,
}

impl DecisionReason {
    /// Detail for audit records; not for callers
    pub fn describe(&self) -> String {
        match self {
            Self::Granted { role_id } => format!("granted by role {}", role_id),
            Self::NoRoles => "principal holds no effective roles".to_string(),
            Self::NoMatchingPermission => "no role carries a matching permission".to_string(),
        }
    }
}

/// Authorization decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Unique decision ID
    pub id: String,

    pub allowed: bool,

    /// Role whose permission granted access; allows only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<RoleId>,

    #[serde(skip)]
    pub reason: Option<DecisionReason>,

    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn allow(role_id: RoleId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            allowed: true,
            granted_by: Some(role_id.clone()),
            reason: Some(DecisionReason::Granted { role_id }),
            timestamp: Utc::now(),
        }
    }

    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            allowed: false,
            granted_by: None,
            reason: Some(reason),
            timestamp: Utc::now(),
        }
    }

    /// Generic message safe to return to the caller
    pub fn message(&self) -> &'static str {
        if self.allowed {
            "access granted"
        } else {
            DENIED_MESSAGE
        }
    }
}

/// Outcome of one item of a bulk check. Errors stay errors; they are never
/// folded into a deny.
#[derive(Debug)]
pub struct BulkCheckResult {
    pub check: PermissionCheck,
    pub result: Result<Decision, AuthzError>,
}

impl BulkCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(&self.result, Ok(decision) if decision.allowed)
    }
}
