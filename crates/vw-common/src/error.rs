//! Error types for vmwatch.
//!
//! Every error carries a stable numeric code and a category so that CLI
//! output and logs can be filtered without string matching:
//!
//! ```text
//! 10-19  discovery / naming
//! 20-29  attach
//! 30-39  decode
//! 40-49  configuration and identifiers
//! 60-69  I/O and serialization
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::InstanceId;

/// Result type alias for vmwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Instance discovery and backing-file naming.
    Discovery,
    /// Establishing a view onto an instrumentation region.
    Attach,
    /// Decoding an attached region.
    Decode,
    /// Configuration and host identifiers.
    Config,
    /// File I/O and serialization.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Discovery => write!(f, "discovery"),
            ErrorCategory::Attach => write!(f, "attach"),
            ErrorCategory::Decode => write!(f, "decode"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for vmwatch.
#[derive(Error, Debug)]
pub enum Error {
    // Discovery errors (10-19)
    /// Target instance is absent or has already exited.
    #[error("instance {id} not found")]
    NotFound { id: InstanceId },

    /// A scanned file name matches no known backing-file convention.
    /// Never surfaced by the scanner; kept for callers parsing names directly.
    #[error("malformed backing file name: {0}")]
    MalformedName(String),

    // Attach errors (20-29)
    #[error("failed to attach to instance {id}: {source}")]
    AttachFailure {
        id: InstanceId,
        #[source]
        source: std::io::Error,
    },

    // Decode errors (30-39)
    #[error("failed to decode instrumentation of instance {id}: {reason}")]
    DecodeFailure { id: InstanceId, reason: String },

    // Configuration errors (40-49)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid host identifier: {0}")]
    InvalidHostId(String),

    #[error("unsupported monitoring protocol: {0}")]
    UnsupportedProtocol(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::NotFound { .. } => 10,
            Error::MalformedName(_) => 11,
            Error::AttachFailure { .. } => 20,
            Error::DecodeFailure { .. } => 30,
            Error::Config(_) => 40,
            Error::InvalidHostId(_) => 41,
            Error::UnsupportedProtocol(_) => 42,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NotFound { .. } | Error::MalformedName(_) => ErrorCategory::Discovery,
            Error::AttachFailure { .. } => ErrorCategory::Attach,
            Error::DecodeFailure { .. } => ErrorCategory::Decode,
            Error::Config(_) | Error::InvalidHostId(_) | Error::UnsupportedProtocol(_) => {
                ErrorCategory::Config
            }
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether retrying the operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::NotFound { .. } => false, // Process is gone
            Error::MalformedName(_) => false,
            Error::AttachFailure { .. } => true, // Can elevate or retry
            Error::DecodeFailure { .. } => true,    // Region may be mid-update
            Error::Config(_) | Error::InvalidHostId(_) => true,
            Error::UnsupportedProtocol(_) => false,
            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }

    /// Whether this error reports an absent instance.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether an attach failed because the caller lacks access.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Error::AttachFailure { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied
        ) || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }

    /// Shorthand for a decode failure.
    pub fn decode(id: InstanceId, reason: impl Into<String>) -> Self {
        Error::DecodeFailure {
            id,
            reason: reason.into(),
        }
    }
}

/// Structured error payload for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: u32,
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        ErrorReport {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}
