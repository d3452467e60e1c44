//! Exit codes for the vmwatch CLI.
//!
//! Exit code ranges:
//! - 0: success
//! - 10-19: user/environment errors (recoverable by user action)
//! - 20-29: internal errors

use vw_common::Error;

/// Exit codes for vmwatch commands.
///
/// These codes are a stable contract for scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Clean = 0,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments or configuration
    ArgsError = 10,

    /// Permission denied attaching to an instance
    PermissionError = 12,

    /// Instance not found or already exited
    NotFound = 15,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Check if this exit code is a user/environment error (codes 10-19).
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    /// Check if this exit code is an internal error (codes 20-29).
    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::NotFound => "ERR_NOT_FOUND",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        if err.is_permission_denied() {
            return ExitCode::PermissionError;
        }
        match err {
            Error::NotFound { .. } => ExitCode::NotFound,
            Error::Config(_) | Error::InvalidHostId(_) | Error::UnsupportedProtocol(_) => {
                ExitCode::ArgsError
            }
            Error::AttachFailure { .. } | Error::Io(_) => ExitCode::IoError,
            Error::MalformedName(_) | Error::DecodeFailure { .. } | Error::Json(_) => {
                ExitCode::InternalError
            }
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.as_i32() as u8)
    }
}
