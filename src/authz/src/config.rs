//! Engine configuration

use crate::engine::endpoint::EndpointRule;
use crate::error::{AuthzError, Result};
use crate::inheritance::{org_context::ORGANIZATIONS_TTL_SECS, EFFECTIVE_ROLES_TTL_SECS};
use std::time::Duration;

/// Default TTL for role permission and descendant closures (seconds)
pub const CLOSURE_TTL_SECS: u64 = 900;

/// Authorization engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL of `org:{org}:user:{principal}:effective_roles`
    pub effective_roles_ttl_secs: u64,

    /// TTL of `user:{principal}:organizations`
    pub organizations_ttl_secs: u64,

    /// TTL of `role:{id}`, `role:{id}:permissions` and `role:{id}:descendants`
    pub closure_ttl_secs: u64,

    /// Emit an audit record for every denial
    pub audit_denials: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Explicit endpoint → permission rules
    pub endpoint_rules: Vec<EndpointRule>,

    /// Map `/api/v{n}/{collection}/{id}` paths when no rule matches
    pub path_convention_fallback: bool,

    /// Upper bound applied to every check on top of the caller's deadline
    pub request_timeout: Option<Duration>,

    /// Capacity of the in-memory cache
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            effective_roles_ttl_secs: EFFECTIVE_ROLES_TTL_SECS,
            organizations_ttl_secs: ORGANIZATIONS_TTL_SECS,
            closure_ttl_secs: CLOSURE_TTL_SECS,
            audit_denials: true,
            enable_metrics: true,
            endpoint_rules: Vec::new(),
            path_convention_fallback: true,
            request_timeout: None,
            cache_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    /// Build the configuration from the environment.
    ///
    /// - `AUTHZ_EFFECTIVE_ROLES_TTL` - seconds (default: 300)
    /// - `AUTHZ_ORGANIZATIONS_TTL` - seconds (default: 300)
    /// - `AUTHZ_CLOSURE_TTL` - seconds (default: 900)
    /// - `AUTHZ_AUDIT_DENIALS` - `true`/`false` (default: true)
    /// - `AUTHZ_METRICS` - `true`/`false` (default: true)
    /// - `AUTHZ_ENDPOINTS_FILE` - JSON file of endpoint rules
    /// - `AUTHZ_PATH_CONVENTION` - `true`/`false` (default: true)
    /// - `AUTHZ_REQUEST_TIMEOUT_MS` - per-check timeout
    /// - `AUTHZ_CACHE_SIZE` - cache capacity (default: 10000)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let endpoint_rules = match lookup("AUTHZ_ENDPOINTS_FILE") {
            Some(path) if !path.trim().is_empty() => {
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    AuthzError::Validation(format!("cannot read endpoint rules {}: {}", path, e))
                })?;
                serde_json::from_str(&json).map_err(|e| {
                    AuthzError::Validation(format!("invalid endpoint rules in {}: {}", path, e))
                })?
            }
            _ => defaults.endpoint_rules,
        };

        Ok(Self {
            effective_roles_ttl_secs: lookup("AUTHZ_EFFECTIVE_ROLES_TTL")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.effective_roles_ttl_secs),
            organizations_ttl_secs: lookup("AUTHZ_ORGANIZATIONS_TTL")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.organizations_ttl_secs),
            closure_ttl_secs: lookup("AUTHZ_CLOSURE_TTL")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.closure_ttl_secs),
            audit_denials: lookup("AUTHZ_AUDIT_DENIALS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.audit_denials),
            enable_metrics: lookup("AUTHZ_METRICS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.enable_metrics),
            endpoint_rules,
            path_convention_fallback: lookup("AUTHZ_PATH_CONVENTION")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.path_convention_fallback),
            request_timeout: lookup("AUTHZ_REQUEST_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .or(defaults.request_timeout),
            cache_capacity: lookup("AUTHZ_CACHE_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_capacity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.effective_roles_ttl_secs, 300);
        assert_eq!(config.organizations_ttl_secs, 300);
        assert_eq!(config.closure_ttl_secs, 900);
        assert!(config.audit_denials);
        assert!(config.path_convention_fallback);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = EngineConfig::from_lookup(lookup(HashMap::from([
            ("AUTHZ_EFFECTIVE_ROLES_TTL", "60".to_string()),
            ("AUTHZ_CLOSURE_TTL", "not-a-number".to_string()),
            ("AUTHZ_AUDIT_DENIALS", "false".to_string()),
            ("AUTHZ_REQUEST_TIMEOUT_MS", "250".to_string()),
        ])))
        .unwrap();

        assert_eq!(config.effective_roles_ttl_secs, 60);
        assert_eq!(config.closure_ttl_secs, CLOSURE_TTL_SECS);
        assert!(!config.audit_denials);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_endpoint_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"method":"GET","pattern":"/reports/{id}","resource":"reports","action":"read"}]"#,
        )
        .unwrap();

        let config = EngineConfig::from_lookup(lookup(HashMap::from([(
            "AUTHZ_ENDPOINTS_FILE",
            file.path().display().to_string(),
        )])))
        .unwrap();

        assert_eq!(config.endpoint_rules.len(), 1);
        assert_eq!(config.endpoint_rules[0].resource, "reports");
    }

    #[test]
    fn test_missing_endpoint_rules_file() {
        let result = EngineConfig::from_lookup(lookup(HashMap::from([(
            "AUTHZ_ENDPOINTS_FILE",
            "/definitely/not/here.json".to_string(),
        )])));
        assert!(matches!(result, Err(AuthzError::Validation(_))));
    }
}
