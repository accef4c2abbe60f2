//! # authz-check
//!
//! One-shot endpoint authorization against a JSON snapshot.
//!
//! ```text
//! authz-check <METHOD> <PATH>
//! ```
//!
//! Environment variables:
//! - `AUTHZ_SNAPSHOT` - path to the store snapshot (required)
//! - `AUTHZ_TOKEN` - `Authorization` header value, `Bearer <jwt>` (required)
//! - `AUTHZ_JWT_SECRET`, `AUTHZ_JWT_ISSUER`, `AUTHZ_JWT_AUDIENCE`,
//!   `AUTHZ_JWT_LEEWAY_SECS` - token verification
//! - `AUTHZ_*` engine settings, see `EngineConfig::from_env`
//! - `RUST_LOG` - log level (default: info)
//!
//! Exit status: 0 allowed, 1 denied, 2 unauthenticated.

use aaa_authz::cache::CacheConfig;
use aaa_authz::{
    telemetry, AuthzError, AuthzServices, EngineConfig, InMemoryCache, MemoryStore,
    RequestContext, TracingAuditService,
};
use aaa_gateway::{extract_bearer, verify, GatewayConfig};
use anyhow::{bail, Context};
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    telemetry::init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(method), Some(path)) = (args.next(), args.next()) else {
        bail!("usage: authz-check <METHOD> <PATH>");
    };

    let snapshot_path = std::env::var("AUTHZ_SNAPSHOT").context("AUTHZ_SNAPSHOT is not set")?;
    let header = std::env::var("AUTHZ_TOKEN").context("AUTHZ_TOKEN is not set")?;

    let snapshot = std::fs::read_to_string(&snapshot_path)
        .with_context(|| format!("reading snapshot {}", snapshot_path))?;
    let store = Arc::new(MemoryStore::from_json(&snapshot).context("parsing snapshot")?);

    let config = EngineConfig::from_env()?;
    let cache = Arc::new(InMemoryCache::new(CacheConfig {
        capacity: config.cache_capacity,
    }));
    let services = AuthzServices::new(store, cache, Arc::new(TracingAuditService), config)?;

    info!("authz-check v{}: {} {}", aaa_authz::VERSION, method, path);

    let gateway = GatewayConfig::from_env();
    let claims = match extract_bearer(&header).and_then(|token| verify(token, &gateway)) {
        Ok(claims) => claims,
        Err(e) => {
            let err = AuthzError::from(e);
            println!(
                "{}",
                json!({ "method": method, "path": path, "allowed": false, "error": err.to_string() })
            );
            return Ok(ExitCode::from(2));
        }
    };

    let ctx = RequestContext::background();
    let allowed = services
        .engine
        .validate_api_endpoint_access(&ctx, claims.principal_id(), &method, &path)
        .await;
    services.engine.flush_audit().await;
    let allowed = allowed?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "principal_id": claims.principal_id(),
            "method": method,
            "path": path,
            "allowed": allowed,
        }))?
    );

    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
