//! # AAA Credential Gateway
//!
//! Bearer-token verification that runs in front of the authorization engine.
//! A token is checked against the configured signing secret, issuer, audience
//! and clock leeway; the result is either [`VerifiedClaims`] or a typed
//! [`GatewayError`].
//!
//! Verification is a pure function of the token and the configuration: no
//! caching, no I/O.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aaa_gateway::{extract_bearer, verify, GatewayConfig};
//!
//! # fn example(header: &str) -> Result<(), aaa_gateway::GatewayError> {
//! let config = GatewayConfig::new("signing-secret")
//!     .with_issuer("aaa-service")
//!     .with_audience("aaa-clients");
//!
//! let token = extract_bearer(header)?;
//! let claims = verify(token, &config)?;
//! println!("authenticated principal {}", claims.principal_id());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod token;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result, UnauthenticatedReason};
pub use token::{extract_bearer, verify, Audience, JwtClaims, VerifiedClaims};
