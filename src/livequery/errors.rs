//! # Live Query Errors
//!
//! Error types for the live query engine.
//!
//! Dispatch-time failures are never surfaced to clients: an evaluation error
//! degrades to no-match for that one (event, subscription) pair. Only
//! subscribe-time validation errors travel back over the transport.

use thiserror::Error;

/// Result type for live query operations
pub type LiveQueryResult<T> = Result<T, LiveQueryError>;

/// Live query errors
#[derive(Debug, Clone, Error)]
pub enum LiveQueryError {
    // ==================
    // Subscribe-time errors (surfaced to the client)
    // ==================
    /// Query constraint tree failed validation
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// Too many subscriptions on one connection
    #[error("Too many subscriptions (max: {0})")]
    TooManySubscriptions(usize),

    /// Session lacks permission to subscribe to this class
    #[error("Not authorized to subscribe to class {0}")]
    SubscribeDenied(String),

    /// Authentication required for this class
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Unsubscribe for an id that was never registered
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    // ==================
    // Connection errors
    // ==================
    /// Connection has been closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue exceeded its bound
    #[error("Outbound queue overflow")]
    ConnectionOverflow,

    /// Invalid message format on the wire
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    // ==================
    // Dispatch-time errors (internal only)
    // ==================
    /// Matcher or filter failed for one (event, subscription) pair
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    // ==================
    // Internal errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Session token rejected
    #[error("Authentication error: {0}")]
    AuthError(String),
}

/// Failure while evaluating one (event, subscription) pair.
///
/// Both variants are isolated by the dispatcher: logged, counted, and
/// treated as no-match. They never abort dispatch to other subscriptions.
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    /// Storage collaborator failed a related-class lookup
    #[error("Related lookup against {class} failed: {reason}")]
    RelatedLookup { class: String, reason: String },

    /// Identity collaborator failed to resolve roles
    #[error("Role resolution failed for {principal}: {reason}")]
    RoleResolution { principal: String, reason: String },
}

impl LiveQueryError {
    /// Stable error code carried in error replies on the wire
    pub fn code(&self) -> &'static str {
        match self {
            LiveQueryError::MalformedQuery(_) => "MALFORMED_QUERY",
            LiveQueryError::TooManySubscriptions(_) => "TOO_MANY_SUBSCRIPTIONS",
            LiveQueryError::SubscribeDenied(_) => "SUBSCRIBE_DENIED",
            LiveQueryError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            LiveQueryError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            LiveQueryError::ConnectionClosed => "CONNECTION_CLOSED",
            LiveQueryError::ConnectionOverflow => "CONNECTION_OVERFLOW",
            LiveQueryError::InvalidMessage(_) => "INVALID_MESSAGE",
            LiveQueryError::Evaluation(_) => "EVALUATION_FAILED",
            LiveQueryError::Internal(_) => "INTERNAL",
            LiveQueryError::ConfigError(_) => "CONFIG",
            LiveQueryError::AuthError(_) => "AUTH_FAILED",
        }
    }

    /// Returns the close code for WebSocket
    pub fn close_code(&self) -> u16 {
        match self {
            LiveQueryError::ConnectionClosed => 1000,
            LiveQueryError::InvalidMessage(_) => 1003,
            LiveQueryError::MalformedQuery(_) => 4000,
            LiveQueryError::SubscriptionNotFound(_) => 4001,
            LiveQueryError::TooManySubscriptions(_) => 4002,
            LiveQueryError::SubscribeDenied(_) => 4003,
            LiveQueryError::AuthenticationRequired => 4004,
            LiveQueryError::AuthError(_) => 4003,
            LiveQueryError::ConnectionOverflow => 4008,
            LiveQueryError::Evaluation(_) => 4500,
            LiveQueryError::Internal(_) => 4500,
            LiveQueryError::ConfigError(_) => 4501,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_close_codes() {
        assert_eq!(LiveQueryError::ConnectionClosed.close_code(), 1000);
        assert_eq!(
            LiveQueryError::MalformedQuery("bad".to_string()).close_code(),
            4000
        );
        assert_eq!(LiveQueryError::ConnectionOverflow.close_code(), 4008);
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(
            LiveQueryError::MalformedQuery("x".to_string()).code(),
            "MALFORMED_QUERY"
        );
        assert_eq!(LiveQueryError::AuthenticationRequired.code(), "AUTHENTICATION_REQUIRED");
    }

    #[test]
    fn test_evaluation_error_wraps() {
        let err: LiveQueryError = EvaluationError::RelatedLookup {
            class: "Team".to_string(),
            reason: "unavailable".to_string(),
        }
        .into();
        assert_eq!(err.code(), "EVALUATION_FAILED");
    }
}
