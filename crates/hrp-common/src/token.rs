//! Signed access-token claims and validation.
//!
//! Tokens are HS256 JWTs over a shared symmetric secret. The audience claim
//! must equal the exact resource path being invoked; validation is pure and
//! performs no I/O, so it can run before any registry or dispatch work.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Claim set carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Audience: the full resource path this token authorizes.
    pub aud: String,
    /// Optional subject (user identity).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry as Unix seconds.
    pub exp: u64,
}

/// The authenticated identity extracted from a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Subject claim, if the token carried one.
    pub subject: Option<String>,
}

/// Reasons an access token is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The token is absent or cannot be parsed or decoded.
    #[error("malformed token")]
    Malformed,
    /// The signature does not verify against the shared secret.
    #[error("token signature mismatch")]
    SignatureMismatch,
    /// The expiry claim is in the past (beyond the skew window).
    #[error("token expired")]
    Expired,
    /// The audience claim does not exactly match the invoked resource path.
    #[error("token audience mismatch")]
    AudienceMismatch,
}

/// Signs a claim set with the shared secret, producing a compact JWT.
///
/// # Errors
///
/// Returns an error if serialization of the claims fails.
pub fn sign(claims: &Claims, secret: &[u8]) -> Result<String, jsonwebtoken::errors::Error> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Validates a token against the shared secret and an expected audience.
///
/// The skew window is applied to the expiry claim only; audience comparison
/// is exact string equality with no tolerance.
///
/// # Errors
///
/// Returns an [`AuthError`] naming the first check that failed.
pub fn validate(
    token: &str,
    secret: &[u8],
    expected_aud: &str,
    skew: Duration,
) -> Result<Principal, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[expected_aud]);
    validation.leeway = skew.as_secs();

    let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => AuthError::AudienceMismatch,
            jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::SignatureMismatch,
            _ => AuthError::Malformed,
        })?;

    Ok(Principal {
        subject: data.claims.sub,
    })
}

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch (indicates a
/// misconfigured system clock). Callers should handle this case.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
