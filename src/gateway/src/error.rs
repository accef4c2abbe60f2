//! Error types for credential verification

use std::fmt;
use thiserror::Error;

/// Why a credential was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnauthenticatedReason {
    /// No bearer token was supplied
    MissingToken,
    /// Token is not a well-formed JWT or its claims cannot be decoded
    Malformed,
    /// Signature does not verify against the configured secret
    InvalidSignature,
    /// `now > exp + leeway`
    Expired,
    /// `now < nbf - leeway`
    NotYetValid,
    /// `iss` does not equal the configured issuer
    IssuerMismatch,
    /// `aud` (string or array) does not contain the configured audience
    AudienceMismatch,
    /// A required registered claim is absent
    MissingClaim(String),
}

impl fmt::Display for UnauthenticatedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingToken => write!(f, "missing bearer token"),
            Self::Malformed => write!(f, "malformed token"),
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::Expired => write!(f, "token has expired"),
            Self::NotYetValid => write!(f, "token is not yet valid"),
            Self::IssuerMismatch => write!(f, "issuer mismatch"),
            Self::AudienceMismatch => write!(f, "audience mismatch"),
            Self::MissingClaim(claim) => write!(f, "missing required claim '{}'", claim),
        }
    }
}

/// Credential gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The credential was rejected
    #[error("unauthenticated: {reason}")]
    Unauthenticated { reason: UnauthenticatedReason },

    /// The gateway itself is misconfigured (e.g. empty secret)
    #[error("gateway configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    pub fn unauthenticated(reason: UnauthenticatedReason) -> Self {
        Self::Unauthenticated { reason }
    }

    /// The rejection reason, if this is an authentication failure
    pub fn reason(&self) -> Option<&UnauthenticatedReason> {
        match self {
            Self::Unauthenticated { reason } => Some(reason),
            Self::Configuration(_) => None,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        let reason = match err.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                UnauthenticatedReason::InvalidSignature
            }
            ErrorKind::ExpiredSignature => UnauthenticatedReason::Expired,
            ErrorKind::ImmatureSignature => UnauthenticatedReason::NotYetValid,
            ErrorKind::InvalidIssuer => UnauthenticatedReason::IssuerMismatch,
            ErrorKind::InvalidAudience => UnauthenticatedReason::AudienceMismatch,
            ErrorKind::MissingRequiredClaim(claim) => {
                UnauthenticatedReason::MissingClaim(claim.clone())
            }
            ErrorKind::InvalidKeyFormat | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey => {
                return GatewayError::Configuration(err.to_string());
            }
            _ => UnauthenticatedReason::Malformed,
        };

        GatewayError::unauthenticated(reason)
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
