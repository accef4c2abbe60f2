//! # Authorization & Role Resolution Engine
//!
//! Decides whether a principal may perform an action on a resource.
//!
//! ## Features
//!
//! - **Role hierarchy** with single-parent, acyclic trees; a role carries the
//!   permissions of its descendants
//! - **Group hierarchy** per organization; members inherit roles granted to
//!   their groups and every ancestor group
//! - **Time-windowed** memberships and grants
//! - **Push-based cache invalidation** over a pluggable [`CacheService`]
//! - **Default deny**; store or cache failures are errors, never decisions
//!
//! ## Example
//!
//! ```rust
//! use aaa_authz::{
//!     AuthzServices, EngineConfig, InMemoryCache, MemoryAuditService, MemoryStore,
//!     RequestContext,
//! };
//! use aaa_authz::types::{Permission, Role, RoleAssignment};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     store.put_role(Role::new("viewer", "Viewer")).await;
//!     store.put_permission(Permission::new("doc-read", "documents", "read")).await;
//!     store.grant_permission("viewer", "doc-read").await;
//!     store.put_assignment(RoleAssignment::new("alice", "viewer")).await;
//!
//!     let services = AuthzServices::new(
//!         store,
//!         Arc::new(InMemoryCache::default()),
//!         Arc::new(MemoryAuditService::new()),
//!         EngineConfig::default(),
//!     )?;
//!
//!     let ctx = RequestContext::background();
//!     let decision = services
//!         .engine
//!         .check_permission(&ctx, "alice", "documents", None, "read")
//!         .await?;
//!
//!     if decision.allowed {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod inheritance;
pub mod invalidation;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditService, MemoryAuditService, TracingAuditService};
pub use cache::{CacheService, InMemoryCache, NoopCache};
pub use config::EngineConfig;
pub use context::RequestContext;
pub use engine::{AuthzEngine, BulkCheckResult, Decision, PermissionCheck};
pub use error::{AuthzError, Result};
pub use hierarchy::{AddMember, GroupService, RoleHierarchyService};
pub use inheritance::{OrganizationalContextProvider, RoleInheritanceEngine};
pub use services::AuthzServices;
pub use store::{AuthzStore, MemoryStore, Snapshot, StoreError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
