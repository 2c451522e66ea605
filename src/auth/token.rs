//! # Session Tokens
//!
//! JWT access tokens presented by clients over the live query transport.
//!
//! Validation is stateless: signature, issuer, audience, and expiry are
//! checked locally with no store lookup. Roles are deliberately not claims —
//! they are resolved fresh per dispatched event, so a token outliving a
//! revocation does not keep stale grants alive.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::livequery::session::SessionContext;

use super::errors::{AuthError, AuthResult};

/// JWT claims for live query access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (principal id)
    pub sub: String,

    /// Issued at (Unix epoch seconds)
    pub iat: i64,

    /// Expiration (Unix epoch seconds)
    pub exp: i64,

    /// Audience
    pub aud: String,

    /// Issuer
    pub iss: String,
}

/// Token configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Signing secret (256-bit minimum recommended)
    pub secret: String,

    /// Access token lifetime
    pub ttl: Duration,

    /// Issuer identifier
    pub issuer: String,

    /// Audience identifier
    pub audience: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "CHANGE_THIS_SECRET_IN_PRODUCTION".to_string(),
            ttl: Duration::hours(1),
            issuer: "stratodb".to_string(),
            audience: "stratodb".to_string(),
        }
    }
}

/// Validates (and, for tests and tooling, issues) session tokens
#[derive(Clone)]
pub struct TokenValidator {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenValidator {
    pub fn new(config: TokenConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Issue a token for a principal
    pub fn issue(&self, principal: Uuid) -> AuthResult<String> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: principal.to_string(),
            iat: now.timestamp(),
            exp: (now + self.config.ttl).timestamp(),
            aud: self.config.audience.clone(),
            iss: self.config.issuer.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::TokenGenerationFailed)
    }

    /// Validate a token and build the session context it carries
    pub fn validate(&self, token: &str) -> AuthResult<SessionContext> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.config.audience]);
        validation.set_issuer(&[&self.config.issuer]);

        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::MalformedToken,
            },
        )?;

        let principal =
            Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::MalformedToken)?;
        Ok(SessionContext::authenticated(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(TokenConfig::default())
    }

    #[test]
    fn test_issue_and_validate_round_trip() {
        let validator = validator();
        let principal = Uuid::new_v4();

        let token = validator.issue(principal).unwrap();
        let session = validator.validate(&token).unwrap();

        assert!(session.authenticated);
        assert_eq!(session.principal, Some(principal));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let result = validator().validate("not.a.token");
        assert!(matches!(result, Err(AuthError::MalformedToken)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuing = validator();
        let token = issuing.issue(Uuid::new_v4()).unwrap();

        let other = TokenValidator::new(TokenConfig {
            secret: "a-different-secret-entirely".to_string(),
            ..TokenConfig::default()
        });
        let result = other.validate(&token);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let validator = TokenValidator::new(TokenConfig {
            ttl: Duration::seconds(-120),
            ..TokenConfig::default()
        });
        let token = validator.issue(Uuid::new_v4()).unwrap();

        let result = validator.validate(&token);
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }
}
