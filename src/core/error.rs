//! Unified error handling for pingagg
//!
//! Every failure that can befall a single exchange is represented here, so a
//! failed upstream call can be stored in its slot and later rendered into the
//! merged body without losing why it failed.

use std::fmt;

/// Error types for configuration loading and per-request aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Malformed configuration, fatal at startup
    Configuration(String),

    /// An upstream call could not be issued
    Dispatch(String),

    /// An upstream call did not complete within its budget
    UpstreamTimeout,

    /// An upstream call failed in transport
    Upstream(String),

    /// An upstream call completed with a non-success status
    Status(u16),

    /// The call completed but its body could not be retrieved
    BodyRead(String),

    /// An upstream body is not a well-formed JSON document
    Merge(String),

    /// Internal system errors
    Internal(String),
}

impl ProxyError {
    /// Stable identifier used in failure markers of the merged body.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Configuration(_) => "configuration",
            ProxyError::Dispatch(_) => "dispatch",
            ProxyError::UpstreamTimeout => "timeout",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::Status(_) => "status",
            ProxyError::BodyRead(_) => "body_read",
            ProxyError::Merge(_) => "merge",
            ProxyError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            ProxyError::Dispatch(msg) => write!(f, "Dispatch failed: {msg}"),
            ProxyError::UpstreamTimeout => write!(f, "Upstream call timed out"),
            ProxyError::Upstream(msg) => write!(f, "Upstream call failed: {msg}"),
            ProxyError::Status(code) => write!(f, "Upstream call returned status {code}"),
            ProxyError::BodyRead(msg) => write!(f, "Failed to read call response body: {msg}"),
            ProxyError::Merge(msg) => write!(f, "Invalid upstream document: {msg}"),
            ProxyError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<validator::ValidationErrors> for ProxyError {
    fn from(err: validator::ValidationErrors) -> Self {
        ProxyError::Configuration(err.to_string())
    }
}

impl From<ProxyError> for Box<pingora_error::Error> {
    fn from(err: ProxyError) -> Self {
        let etype = match err {
            ProxyError::Configuration(_) => pingora_error::ErrorType::FileReadError,
            _ => pingora_error::ErrorType::InternalError,
        };
        pingora_error::Error::explain(etype, err.to_string())
    }
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
