//! Error types for Warden
//!
//! One crate-wide error enum so every subsystem reports through the same
//! taxonomy. Callers branch on variants (`is_not_found`, `is_unsupported`),
//! never on message strings.

use hyper::StatusCode;

/// Main error type for Warden operations
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Expected during bootstrap: a missing record drives creation logic.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authenticated decryption failed. The data is tampered or the wrong
    /// key was used; the read must fail, never degrade to plaintext.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The provider does not support this operation. Callers may fall
    /// through to a default path instead of aborting.
    #[error("Not implemented: {0}")]
    Unsupported(&'static str),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// A one-time password was already consumed. Kept distinct from
    /// `Auth` for logging; collapsed into a generic failure at the API.
    #[error("One-time password already used")]
    OtpAlreadyUsed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::OtpAlreadyUsed => StatusCode::UNAUTHORIZED,
            Self::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the expected bootstrap case where a record does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when a provider reported the operation as unsupported.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// True for credential failures that must surface to the end user as
    /// one generic authentication error.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::OtpAlreadyUsed | Self::NotFound(_))
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for WardenError {
    fn from(err: hyper::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<rusqlite::Error> for WardenError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rustls::Error> for WardenError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for WardenError {
    fn from(err: rcgen::Error) -> Self {
        Self::Tls(format!("certificate generation: {}", err))
    }
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
