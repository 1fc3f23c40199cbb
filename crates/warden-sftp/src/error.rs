//! Error types for the SFTP server
//!
//! NIST 800-53: SI-11 (Error Handling)
//! Implementation: Errors carry detail for the server log; the peer only ever
//! sees a status code and a sanitized message.

use thiserror::Error;

use crate::protocol::StatusCode;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport or key handling error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP protocol violation or malformed packet
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Username is not present in the customer registry
    #[error("Unknown customer: {0}")]
    CustomerNotFound(String),

    /// Path failed validation or escaped the sandbox
    ///
    /// NIST 800-53: SI-10 (Input Validation)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Permission denied
    ///
    /// NIST 800-53: AC-3 (Access Enforcement)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unknown or already closed handle
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Per-session resource limit reached
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Check if error has security implications and should be logged at warn
    ///
    /// NIST 800-53: AU-2 (Audit Events)
    pub const fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::CustomerNotFound(_)
                | Self::PermissionDenied(_)
                | Self::InvalidPath(_)
        )
    }

    /// SFTP status code reported to the peer for this error
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Self::Io(e) => StatusCode::from_io_error(e),
            Self::CustomerNotFound(_) | Self::PermissionDenied(_) | Self::InvalidPath(_) => {
                StatusCode::PermissionDenied
            }
            Self::Protocol(_) => StatusCode::BadMessage,
            Self::NotSupported(_) => StatusCode::OpUnsupported,
            Self::Connection(_) => StatusCode::ConnectionLost,
            _ => StatusCode::Failure,
        }
    }

    /// Message safe to send to the peer
    ///
    /// NIST 800-53: SI-11
    /// Implementation: Never reveals paths, usernames or why authentication failed
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Authentication(_) | Self::CustomerNotFound(_) => {
                "Authentication failed".to_string()
            }
            Self::PermissionDenied(_) => "Permission denied".to_string(),
            Self::InvalidPath(_) => "Invalid path".to_string(),
            Self::Config(_) => "Server configuration error".to_string(),
            Self::Io(e) => StatusCode::from_io_error(e).message().to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}
