//! Gateway configuration.

use jsonwebtoken::Algorithm;

/// Default clock leeway applied to `exp` and `nbf` (seconds).
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Configuration for bearer-token verification.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Shared HMAC signing secret.
    pub secret: String,
    /// Expected `iss` claim. `None` skips the issuer check.
    pub issuer: Option<String>,
    /// Expected audience. `None` skips the audience check.
    pub audience: Option<String>,
    /// Clock leeway in seconds for `exp`/`nbf`.
    pub leeway_secs: u64,
    /// Signing algorithm (HS256 by default).
    pub algorithm: Algorithm,
}

impl GatewayConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            audience: None,
            leeway_secs: DEFAULT_LEEWAY_SECS,
            algorithm: Algorithm::HS256,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Build the configuration from the environment.
    ///
    /// - `AUTHZ_JWT_SECRET` - signing secret (required, may be empty and is then
    ///   rejected at verification time)
    /// - `AUTHZ_JWT_ISSUER` - expected issuer
    /// - `AUTHZ_JWT_AUDIENCE` - expected audience
    /// - `AUTHZ_JWT_LEEWAY_SECS` - leeway (default: 30)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`GatewayConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            secret: lookup("AUTHZ_JWT_SECRET").unwrap_or_default(),
            issuer: non_empty("AUTHZ_JWT_ISSUER"),
            audience: non_empty("AUTHZ_JWT_AUDIENCE"),
            leeway_secs: lookup("AUTHZ_JWT_LEEWAY_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_LEEWAY_SECS),
            algorithm: Algorithm::HS256,
        }
    }
}

// The secret never appears in logs.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("leeway_secs", &self.leeway_secs)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([("AUTHZ_JWT_SECRET", "s3cret")]);
        let config = GatewayConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.secret, "s3cret");
        assert!(config.issuer.is_none());
        assert!(config.audience.is_none());
        assert_eq!(config.leeway_secs, DEFAULT_LEEWAY_SECS);
    }

    #[test]
    fn test_from_lookup_all_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AUTHZ_JWT_SECRET", "s3cret"),
            ("AUTHZ_JWT_ISSUER", "aaa-service"),
            ("AUTHZ_JWT_AUDIENCE", "clients"),
            ("AUTHZ_JWT_LEEWAY_SECS", "5"),
        ]);
        let config = GatewayConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.issuer.as_deref(), Some("aaa-service"));
        assert_eq!(config.audience.as_deref(), Some("clients"));
        assert_eq!(config.leeway_secs, 5);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = GatewayConfig::new("do-not-print");
        assert!(!format!("{:?}", config).contains("do-not-print"));
    }
}
