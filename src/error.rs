// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Error types for the offline pipeline
//!
//! Errors are grouped by the layer that raises them:
//!
//! - **Configuration**: no server context, invalid settings
//! - **Transfer**: HTTP failures, non-2xx responses, malformed range responses
//! - **File**: disk I/O, permissions, missing directories
//! - **Crypto**: key unavailable, truncated ciphertext blobs
//! - **State**: unknown tasks, illegal lifecycle transitions
//!
//! Queue processing never propagates these to a caller; it records
//! `user_message()` on the failed task instead. Direct calls return them.

use thiserror::Error;

/// Result type alias using our OfflineError type
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Main error type for the offline pipeline
#[derive(Error, Debug)]
pub enum OfflineError {
    // ===== Configuration Errors =====

    /// No session could be resolved for the server id
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ===== Transfer Errors =====

    /// Server answered with a status the executor cannot use
    #[error("Server responded with unexpected status code {status}")]
    TransferFailed {
        status: u16,
        /// Request URL with query parameters removed
        url: String,
    },

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// 206 response without a usable Content-Range, or a total that changed
    #[error("Malformed range response: {0}")]
    MalformedRangeResponse(String),

    /// Body ended before the announced length
    #[error("Transfer incomplete: expected {expected} bytes, got {actual} bytes")]
    IncompleteTransfer {
        expected: u64,
        actual: u64,
    },

    /// Download URL could not be built or parsed
    #[error("Invalid download URL: {0}")]
    InvalidDownloadUrl(String),

    // ===== File/Storage Errors =====

    /// Generic file I/O error with context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    // ===== Crypto Errors =====

    /// Encryption key could not be read, generated or persisted
    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    /// Encrypted blob is shorter than its IV header
    #[error("Malformed encrypted blob: {len} bytes is shorter than the IV")]
    MalformedBlob {
        len: usize,
    },

    // ===== Task/State Errors =====

    /// Download record does not exist
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Lifecycle transition not allowed from the current status
    #[error("Cannot apply '{event}' to a task that is {from}")]
    InvalidTransition {
        from: String,
        event: String,
    },

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<base64::DecodeError> for OfflineError {
    fn from(err: base64::DecodeError) -> Self {
        OfflineError::KeyUnavailable(format!("stored key is not valid base64: {}", err))
    }
}

// Helper methods for creating common errors
impl OfflineError {
    /// Create a TaskNotFound error
    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        OfflineError::TaskNotFound(task_id.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        OfflineError::InternalError(message.into())
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        OfflineError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn file_io(action: &str, path: &std::path::Path, err: std::io::Error) -> Self {
        OfflineError::FileIoError(format!("{} {}: {}", action, path.display(), err))
    }

    /// Check if error is retryable (network errors, 5xx, interrupted bodies)
    pub fn is_retryable(&self) -> bool {
        match self {
            OfflineError::NetworkError { is_transient, .. } => *is_transient,
            OfflineError::TransferFailed { status, .. } => (500..=599).contains(status),
            OfflineError::IncompleteTransfer { .. } => true,
            OfflineError::ReqwestError(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            _ => false,
        }
    }

    /// Check if error comes from the network transfer
    pub fn is_transfer_error(&self) -> bool {
        matches!(
            self,
            OfflineError::TransferFailed { .. }
                | OfflineError::NetworkError { .. }
                | OfflineError::MalformedRangeResponse(_)
                | OfflineError::IncompleteTransfer { .. }
                | OfflineError::InvalidDownloadUrl(_)
                | OfflineError::ReqwestError(_)
        )
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            OfflineError::FileIoError(_) | OfflineError::FileNotFound(_) | OfflineError::IoError(_)
        )
    }

    /// Check if error is related to encryption at rest
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            OfflineError::KeyUnavailable(_) | OfflineError::MalformedBlob { .. }
        )
    }

    /// Get user-friendly error message suitable for display next to a task
    pub fn user_message(&self) -> String {
        match self {
            OfflineError::ServerNotFound(_) => {
                "Server not found. Please sign in to this server again.".to_string()
            }
            OfflineError::TransferFailed { status: 401 | 403, .. } => {
                "The server refused the download. Your session may have expired.".to_string()
            }
            OfflineError::TransferFailed { status: 404, .. } => {
                "This item is no longer available on the server.".to_string()
            }
            OfflineError::TransferFailed { status, .. } => {
                format!("Download failed (server error {}).", status)
            }
            OfflineError::NetworkError { .. } | OfflineError::ReqwestError(_) => {
                "Network connection lost. Please try again.".to_string()
            }
            OfflineError::IncompleteTransfer { .. } => {
                "Download was interrupted. Please try again.".to_string()
            }
            OfflineError::KeyUnavailable(_) => {
                "Could not access the encryption key for offline files.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OfflineError::network_error("reset", true).is_retryable());
        assert!(!OfflineError::network_error("dns", false).is_retryable());
        assert!(OfflineError::TransferFailed { status: 503, url: String::new() }.is_retryable());
        assert!(!OfflineError::TransferFailed { status: 404, url: String::new() }.is_retryable());
        assert!(!OfflineError::MalformedBlob { len: 3 }.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(OfflineError::MalformedBlob { len: 0 }.is_crypto_error());
        assert!(OfflineError::FileNotFound("x".into()).is_file_error());
        assert!(OfflineError::MalformedRangeResponse("x".into()).is_transfer_error());
        assert!(!OfflineError::ServerNotFound("s".into()).is_transfer_error());
    }

    #[test]
    fn test_user_message_hides_details() {
        let err = OfflineError::TransferFailed {
            status: 404,
            url: "https://example.com/Items/1/Download".into(),
        };
        assert!(!err.user_message().contains("example.com"));
    }
}
