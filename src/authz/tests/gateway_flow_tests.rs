//! Bearer token → verified principal → endpoint decision

use aaa_authz::types::{Permission, Role, RoleAssignment};
use aaa_authz::{
    AuthzError, AuthzServices, EngineConfig, InMemoryCache, MemoryAuditService, MemoryStore,
    RequestContext,
};
use aaa_authz::engine::EndpointRule;
use aaa_gateway::{extract_bearer, verify, GatewayConfig};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::sync::Arc;

const SECRET: &str = "integration-secret";

fn bearer(sub: &str, exp_offset_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + exp_offset_secs;
    let token = encode(
        &Header::default(),
        &json!({ "sub": sub, "exp": exp, "iss": "aaa" }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

async fn services() -> AuthzServices {
    let store = Arc::new(MemoryStore::new());
    store.put_role(Role::new("auditor", "Auditor")).await;
    store.put_permission(Permission::new("ledger-read", "ledger", "read")).await;
    store.put_permission(Permission::new("ledger-export", "ledger", "export")).await;
    store.grant_permission("auditor", "ledger-read").await;
    store.grant_permission("auditor", "ledger-export").await;
    store.put_assignment(RoleAssignment::new("erin", "auditor")).await;

    let config = EngineConfig {
        endpoint_rules: vec![EndpointRule::new("POST", "/ledger/{id}/export", "ledger", "export")],
        ..EngineConfig::default()
    };

    AuthzServices::new(
        store,
        Arc::new(InMemoryCache::default()),
        Arc::new(MemoryAuditService::new()),
        config,
    )
    .unwrap()
}

async fn authorize(
    services: &AuthzServices,
    header: &str,
    method: &str,
    path: &str,
) -> Result<bool, AuthzError> {
    let gateway = GatewayConfig::new(SECRET).with_issuer("aaa");
    let claims = extract_bearer(header).and_then(|token| verify(token, &gateway))?;

    services
        .engine
        .validate_api_endpoint_access(&RequestContext::background(), claims.principal_id(), method, path)
        .await
}

#[tokio::test]
async fn test_verified_principal_reaches_engine() {
    let services = services().await;
    let header = bearer("erin", 300);

    assert!(authorize(&services, &header, "GET", "/api/v1/ledger/2024").await.unwrap());
    assert!(authorize(&services, &header, "POST", "/ledger/2024/export").await.unwrap());
    assert!(!authorize(&services, &header, "DELETE", "/api/v1/ledger/2024").await.unwrap());
}

#[tokio::test]
async fn test_expired_token_is_unauthorized() {
    let services = services().await;
    let header = bearer("erin", -3600);

    let result = authorize(&services, &header, "GET", "/api/v1/ledger/2024").await;
    assert!(matches!(result, Err(AuthzError::Unauthorized(_))));
}

#[tokio::test]
async fn test_missing_bearer_is_unauthorized() {
    let services = services().await;

    let result = authorize(&services, "Basic ZXJpbjpwdw==", "GET", "/api/v1/ledger").await;
    assert!(matches!(result, Err(AuthzError::Unauthorized(_))));
}
