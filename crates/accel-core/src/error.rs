//! Error handling for acceld
//!
//! Provides a unified error type and result type for use across all acceld
//! components. Errors carry a kind that drives both propagation policy
//! (maskable errors are logged and swallowed, retry errors are retried at
//! the resync site) and the HTTP status surfaced to API clients.

/// Result type alias for acceld operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for acceld
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was malformed or violated a validation rule
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A required resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A valid request that cannot be honored
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The backing driver or device is unavailable
    #[error("No service: {0}")]
    NoService(String),

    /// Requested functionality is not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal error the caller may ignore; logged, never surfaced
    #[error("Internal error: {0}")]
    InternalMaskable(String),

    /// Error that might get resolved through retry
    #[error("Retry: {0}")]
    Retry(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a no service error
    pub fn no_service(msg: impl Into<String>) -> Self {
        Self::NoService(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an internal error that callers may mask
    pub fn internal_maskable(msg: impl Into<String>) -> Self {
        Self::InternalMaskable(msg.into())
    }

    /// Create a retry error
    pub fn retry(msg: impl Into<String>) -> Self {
        Self::Retry(msg.into())
    }

    /// Check if this error may be logged and swallowed by the caller
    pub fn is_maskable(&self) -> bool {
        matches!(self, Error::InternalMaskable(_))
    }

    /// Check if this error should be retried at a retry-aware call site
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retry(_))
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_) | Error::NotFound(_) | Error::Forbidden(_)
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::NotFound(_) => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::NoService(_) => "no_service",
            Error::NotImplemented(_) => "not_implemented",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
            Error::InternalMaskable(_) => "internal",
            Error::Retry(_) => "retry",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Convert to HTTP status code for the REST surface
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::NoService(_) => 503,
            Error::Timeout(_) => 504,
            Error::NotImplemented(_) => 501,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::bad_request("invalid name");
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(err.to_string(), "Bad request: invalid name");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::bad_request("x").is_client_error());
        assert!(!Error::internal("x").is_client_error());

        assert!(Error::internal_maskable("x").is_maskable());
        assert!(!Error::internal("x").is_maskable());

        assert!(Error::retry("x").is_retryable());
        assert!(!Error::no_service("x").is_retryable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(Error::bad_request("x").to_http_status(), 400);
        assert_eq!(Error::forbidden("x").to_http_status(), 403);
        assert_eq!(Error::not_found("x").to_http_status(), 404);
        assert_eq!(Error::no_service("x").to_http_status(), 503);
        assert_eq!(Error::timeout("x").to_http_status(), 504);
        assert_eq!(Error::internal("x").to_http_status(), 500);
    }

    #[test]
    fn test_maskable_displays_as_internal() {
        // A masked error must not leak its masking through the message
        assert_eq!(
            Error::internal_maskable("oops").to_string(),
            Error::internal("oops").to_string()
        );
    }
}
