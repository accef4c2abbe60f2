//! Error types for the authorization engine

use crate::cache::CacheError;
use crate::store::StoreError;
use aaa_gateway::GatewayError;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Invalid input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Entity does not exist or is soft-deleted
    #[error("Not found: {0}")]
    NotFound(String),

    /// Structural conflict or stale version
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Mutation would introduce a cycle; carries the offending path
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    /// Credential rejected by the gateway
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but not allowed
    #[error("Forbidden")]
    Forbidden,

    /// Backend or cache failure. The cause is logged under the correlation id,
    /// never returned to the caller.
    #[error("Internal error (correlation id {correlation_id})")]
    Internal { correlation_id: String },

    /// Request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Request deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl AuthzError {
    /// Log `cause` at error level and return an opaque internal error.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        error!(correlation_id = %correlation_id, "Internal error: {}", cause);
        Self::Internal { correlation_id }
    }

    /// `true` for conflicts, including cycle rejections
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::CircularDependency(_))
    }

    /// `true` when the outcome of the operation is unknown. Callers must not
    /// treat an indeterminate error as either allow or deny.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            Self::Internal { .. } | Self::Cancelled | Self::DeadlineExceeded
        )
    }
}

impl From<StoreError> for AuthzError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::Backend(cause) => Self::internal(format!("store backend: {}", cause)),
        }
    }
}

impl From<CacheError> for AuthzError {
    fn from(err: CacheError) -> Self {
        Self::internal(err)
    }
}

impl From<GatewayError> for AuthzError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthenticated { reason } => Self::Unauthorized(reason.to_string()),
            GatewayError::Configuration(cause) => Self::internal(format!("gateway: {}", cause)),
        }
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
