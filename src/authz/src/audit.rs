//! Audit emission for denied access and security events
//!
//! Emission is best-effort: the evaluator never waits on an audit sink to
//! return a decision, and a failing sink only produces a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Recorded audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    AccessDenied {
        principal_id: String,
        action: String,
        resource_type: String,
        resource_path: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    SecurityEvent {
        principal_id: String,
        event_type: String,
        path: String,
        success: bool,
        details: Value,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn principal_id(&self) -> &str {
        match self {
            AuditEvent::AccessDenied { principal_id, .. }
            | AuditEvent::SecurityEvent { principal_id, .. } => principal_id,
        }
    }
}

/// Audit sink
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn log_access_denied(
        &self,
        principal_id: &str,
        action: &str,
        resource_type: &str,
        resource_path: &str,
        reason: &str,
    ) -> Result<(), AuditError>;

    async fn log_security_event(
        &self,
        principal_id: &str,
        event_type: &str,
        path: &str,
        success: bool,
        details: Value,
    ) -> Result<(), AuditError>;
}

/// Writes audit events to the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditService;

#[async_trait]
impl AuditService for TracingAuditService {
    async fn log_access_denied(
        &self,
        principal_id: &str,
        action: &str,
        resource_type: &str,
        resource_path: &str,
        reason: &str,
    ) -> Result<(), AuditError> {
        warn!(
            target: "audit",
            principal = %principal_id,
            action = %action,
            resource_type = %resource_type,
            resource_path = %resource_path,
            reason = %reason,
            "Access denied"
        );
        Ok(())
    }

    async fn log_security_event(
        &self,
        principal_id: &str,
        event_type: &str,
        path: &str,
        success: bool,
        details: Value,
    ) -> Result<(), AuditError> {
        info!(
            target: "audit",
            principal = %principal_id,
            event_type = %event_type,
            path = %path,
            success,
            details = %details,
            "Security event"
        );
        Ok(())
    }
}

/// Buffers events in memory; can be switched into a failing mode
#[derive(Clone, Default)]
pub struct MemoryAuditService {
    events: Arc<RwLock<Vec<AuditEvent>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryAuditService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    /// Make every subsequent call fail without recording
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("memory audit sink failing".to_string()));
        }
        self.events.write().await.push(event);
        Ok(())
    }
}

#[async_trait]
impl AuditService for MemoryAuditService {
    async fn log_access_denied(
        &self,
        principal_id: &str,
        action: &str,
        resource_type: &str,
        resource_path: &str,
        reason: &str,
    ) -> Result<(), AuditError> {
        self.record(AuditEvent::AccessDenied {
            principal_id: principal_id.to_string(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_path: resource_path.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await
    }

    async fn log_security_event(
        &self,
        principal_id: &str,
        event_type: &str,
        path: &str,
        success: bool,
        details: Value,
    ) -> Result<(), AuditError> {
        self.record(AuditEvent::SecurityEvent {
            principal_id: principal_id.to_string(),
            event_type: event_type.to_string(),
            path: path.to_string(),
            success,
            details,
            timestamp: Utc::now(),
        })
        .await
    }
}
