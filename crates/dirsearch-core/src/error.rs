//! Error types for directory-search operations.
//!
//! Every failure the broker can observe is a variant of [`Error`]. Variants are grouped into an
//! [`ErrorKind`] which decides how the failure is handled: configuration errors are recovered
//! with defaults, node errors advance the search to the next node, buffer and continuation
//! errors are surfaced to the caller as retryable, and fatal errors abort the call.

use crate::ids::ContinuationId;
use thiserror::Error;

/// Main error type for directory-search operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Persistence or filesystem failure
    #[error("I/O error: {0}")]
    IoError(String),

    /// Failed to parse a stored document
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Invalid endpoint URL
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Backend node could not be opened or stopped answering
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// Record type is not served by the node
    #[error("Invalid record type: {0}")]
    InvalidRecordType(String),

    /// Record name is not valid for the node
    #[error("Invalid record name: {0}")]
    InvalidRecordName(String),

    /// The node has no mapping for the requested record type or attribute
    #[error("No mapping: {0}")]
    NoMapping(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// External service error
    #[error("External service error: {service}: {message}")]
    ExternalServiceError {
        /// Service name that failed
        service: String,
        /// Error message
        message: String,
    },

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Not implemented by the node
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The output buffer cannot hold even a single record.
    ///
    /// When raised by the broker the query progress is preserved under `continuation`; the
    /// caller retries with a larger buffer and the same continuation.
    #[error("Buffer too small")]
    BufferTooSmall {
        /// Continuation to resume with once the buffer has been enlarged
        continuation: Option<ContinuationId>,
    },

    /// Continuation data is unknown, stale, or was invalidated by a policy switch
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Session handle is unknown or closed
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// Search target name is not registered
    #[error("Unknown search target: {0}")]
    UnknownTarget(String),

    /// Invalid UUID format
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    /// The broker is not accepting requests
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No search path exists for the target
    #[error("Search path not configured: {0}")]
    SearchPathNotConfigured(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Specialized result type for directory-search operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or corrupt configuration; recovered locally with defaults.
    Configuration,
    /// Failure of a single backend node; the search moves to the next node.
    Node,
    /// Caller buffer too small; retryable with the continuation preserved.
    Buffer,
    /// Stale or invalid continuation; the caller must restart the query.
    Continuation,
    /// Malformed or misdirected request.
    Request,
    /// Unrecoverable; the call is aborted.
    Fatal,
}

impl Error {
    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::IoError(_) => "IO_ERROR",
            Self::ParseError(_) => "PARSE_ERROR",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            Self::NodeUnavailable(_) => "NODE_UNAVAILABLE",
            Self::InvalidRecordType(_) => "INVALID_RECORD_TYPE",
            Self::InvalidRecordName(_) => "INVALID_RECORD_NAME",
            Self::NoMapping(_) => "NO_MAPPING",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::BufferTooSmall { .. } => "BUFFER_TOO_SMALL",
            Self::InvalidContext(_) => "INVALID_CONTEXT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidSession(_) => "INVALID_SESSION",
            Self::UnknownTarget(_) => "UNKNOWN_TARGET",
            Self::InvalidUuid(_) => "INVALID_UUID",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::SearchPathNotConfigured(_) => "SEARCH_PATH_NOT_CONFIGURED",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the recovery class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigError(_)
            | Self::IoError(_)
            | Self::ParseError(_)
            | Self::ValidationError(_)
            | Self::InvalidEndpoint(_) => ErrorKind::Configuration,
            Self::NodeUnavailable(_)
            | Self::InvalidRecordType(_)
            | Self::InvalidRecordName(_)
            | Self::NoMapping(_)
            | Self::NotFound(_)
            | Self::ExternalServiceError { .. }
            | Self::Timeout(_)
            | Self::NotImplemented(_) => ErrorKind::Node,
            Self::BufferTooSmall { .. } => ErrorKind::Buffer,
            Self::InvalidContext(_) => ErrorKind::Continuation,
            Self::InvalidRequest(_)
            | Self::InvalidSession(_)
            | Self::UnknownTarget(_)
            | Self::InvalidUuid(_)
            | Self::ServiceUnavailable(_) => ErrorKind::Request,
            Self::SearchPathNotConfigured(_) | Self::InternalError(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the error is confined to one backend node.
    #[must_use]
    pub const fn is_node_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Node)
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::InternalError(_)
                | Self::ConfigError(_)
                | Self::SearchPathNotConfigured(_)
                | Self::ExternalServiceError { .. }
        )
    }
}

// Conversions from external error types
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidEndpoint(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ValidationError(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidUuid(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::InternalError(err.to_string())
    }
}
