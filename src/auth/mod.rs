//! # Authentication
//!
//! Session token validation for the live query transport. Token-to-session
//! resolution happens at the connection boundary; per-object visibility is
//! the dispatcher's job and roles are re-resolved per event.

pub mod errors;
pub mod token;

pub use errors::{AuthError, AuthResult};
pub use token::{SessionClaims, TokenConfig, TokenValidator};
