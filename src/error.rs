//! Error types for dynauth
//!
//! This module defines all error types used throughout the crate, using
//! `thiserror` for ergonomic error handling.
//!
//! Every variant carries a `String` payload (or none), so the enum derives
//! [`Clone`]: the request-deduplication layer hands each joined caller the
//! same error value, which an opaque boxed error type could not provide.

use thiserror::Error;

/// Main error type for dynauth operations
///
/// This enum encompasses all failures that can occur while parsing protocol
/// payloads, registering clients, exchanging tokens, and coordinating
/// providers and sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DynauthError {
    /// A protocol payload had the wrong shape (segment count, non-object
    /// JSON, missing scheme)
    #[error("Malformed protocol payload: {0}")]
    ProtocolFormat(String),

    /// A protocol payload could not be decoded or parsed; carries the
    /// upstream decoder/parser message
    #[error("Failed to parse protocol payload: {0}")]
    ProtocolParse(String),

    /// Dynamic client registration failed (HTTP or response shape)
    #[error("Dynamic client registration failed: {0}")]
    Registration(String),

    /// Authorization-code or refresh exchange failed (HTTP or response shape)
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The operation was cancelled by the user or the caller
    #[error("Operation was cancelled")]
    Cancelled,

    /// Session or account access was not granted
    #[error("Access denied: {0}")]
    PermissionDenied(String),

    /// Unknown provider, session, or token
    #[error("Not found: {0}")]
    NotFound(String),

    /// A provider id was registered twice
    #[error("Provider already registered: {0}")]
    AlreadyRegistered(String),

    /// Secret storage failed (credential store access or token
    /// serialization)
    #[error("Secret storage error: {0}")]
    SecretStorage(String),
}

/// Result type alias for dynauth operations
pub type Result<T> = std::result::Result<T, DynauthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_format_error_display() {
        let error = DynauthError::ProtocolFormat("expected 3 segments".to_string());
        assert_eq!(
            error.to_string(),
            "Malformed protocol payload: expected 3 segments"
        );
    }

    #[test]
    fn test_registration_error_display() {
        let error = DynauthError::Registration("endpoint returned 400".to_string());
        assert_eq!(
            error.to_string(),
            "Dynamic client registration failed: endpoint returned 400"
        );
    }

    #[test]
    fn test_token_exchange_error_display() {
        let error = DynauthError::TokenExchange("invalid_grant".to_string());
        assert_eq!(error.to_string(), "Token exchange failed: invalid_grant");
    }

    #[test]
    fn test_cancelled_error_display() {
        assert_eq!(
            DynauthError::Cancelled.to_string(),
            "Operation was cancelled"
        );
    }

    #[test]
    fn test_not_found_error_display() {
        let error = DynauthError::NotFound("provider 'x'".to_string());
        assert_eq!(error.to_string(), "Not found: provider 'x'");
    }

    #[test]
    fn test_errors_are_cloneable_and_comparable() {
        let error = DynauthError::TokenExchange("boom".to_string());
        let copy = error.clone();
        assert_eq!(error, copy);
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DynauthError>();
    }
}
