//! Bearer token verification

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result, UnauthenticatedReason};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// The `aud` claim: a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(a) => a == audience,
            Audience::Many(list) => list.iter().any(|a| a == audience),
        }
    }
}

/// Decoded JWT claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub iss: Option<String>,
    pub aud: Option<Audience>,
    pub exp: u64,
    pub nbf: Option<u64>,
    pub iat: Option<u64>,
    /// Every claim in the token, including the registered ones above.
    pub raw: Map<String, Value>,
}

impl JwtClaims {
    fn from_map(raw: Map<String, Value>) -> Result<Self> {
        let sub = match raw.get("sub") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(_) => return Err(GatewayError::unauthenticated(UnauthenticatedReason::Malformed)),
            None => {
                return Err(GatewayError::unauthenticated(
                    UnauthenticatedReason::MissingClaim("sub".to_string()),
                ))
            }
        };

        let exp = raw
            .get("exp")
            .and_then(Value::as_u64)
            .ok_or_else(|| GatewayError::unauthenticated(UnauthenticatedReason::Malformed))?;

        let aud = match raw.get("aud") {
            Some(value) => Some(
                serde_json::from_value::<Audience>(value.clone())
                    .map_err(|_| GatewayError::unauthenticated(UnauthenticatedReason::Malformed))?,
            ),
            None => None,
        };

        Ok(Self {
            sub,
            iss: raw.get("iss").and_then(Value::as_str).map(str::to_string),
            aud,
            exp,
            nbf: raw.get("nbf").and_then(Value::as_u64),
            iat: raw.get("iat").and_then(Value::as_u64),
            raw,
        })
    }
}

/// Claims that passed verification. Only [`verify`] constructs this type, so
/// holding one proves the token was checked.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    claims: JwtClaims,
}

impl VerifiedClaims {
    /// Validated principal id (the `sub` claim)
    pub fn principal_id(&self) -> &str {
        &self.claims.sub
    }

    pub fn claims(&self) -> &JwtClaims {
        &self.claims
    }

    pub fn into_claims(self) -> JwtClaims {
        self.claims
    }
}

/// Strip the `Bearer ` scheme from an `Authorization` header value.
pub fn extract_bearer(header: &str) -> Result<&str> {
    let header = header.trim();
    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| GatewayError::unauthenticated(UnauthenticatedReason::MissingToken))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(GatewayError::unauthenticated(UnauthenticatedReason::MissingToken));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(GatewayError::unauthenticated(UnauthenticatedReason::MissingToken));
    }

    Ok(token)
}

/// Verify a bearer token against `config`.
///
/// Checks the signature, `exp` and `nbf` (with leeway), the issuer and
/// audience when configured, and the presence of `exp` and `sub`.
pub fn verify(token: &str, config: &GatewayConfig) -> Result<VerifiedClaims> {
    if config.secret.is_empty() {
        return Err(GatewayError::Configuration(
            "signing secret is empty".to_string(),
        ));
    }
    if token.trim().is_empty() {
        return Err(GatewayError::unauthenticated(UnauthenticatedReason::MissingToken));
    }

    let mut required = vec!["exp", "sub"];
    let mut validation = Validation::new(config.algorithm);
    validation.leeway = config.leeway_secs;
    validation.validate_exp = true;
    validation.validate_nbf = true;

    match &config.issuer {
        Some(issuer) => {
            validation.set_issuer(&[issuer.as_str()]);
            required.push("iss");
        }
        None => validation.iss = None,
    }

    match &config.audience {
        Some(audience) => {
            validation.set_audience(&[audience.as_str()]);
            required.push("aud");
        }
        None => validation.validate_aud = false,
    }
    validation.set_required_spec_claims(&required);

    let key = DecodingKey::from_secret(config.secret.as_bytes());
    let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(|e| {
        debug!("Token rejected: {}", e);
        GatewayError::from(e)
    })?;

    let claims = JwtClaims::from_map(data.claims)?;
    debug!(sub = %claims.sub, "Token verified");

    Ok(VerifiedClaims { claims })
}
