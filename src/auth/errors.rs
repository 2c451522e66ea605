//! # Auth Errors

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Auth errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Token expired
    #[error("Token expired")]
    TokenExpired,

    /// Token signature invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Token malformed or claims unusable
    #[error("Malformed token")]
    MalformedToken,

    /// Token could not be generated
    #[error("Token generation failed")]
    TokenGenerationFailed,
}
