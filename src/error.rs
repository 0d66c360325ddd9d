// src/error.rs
//
// Error taxonomy shared by every backend and by the orchestration layer.

use thiserror::Error;

/// Errors surfaced by storage operations.
///
/// The variants map onto the propagation policy of the orchestrator:
/// * `Configuration`: missing/invalid credentials; `StorageManager::get` turns
///   it into `None`.
/// * `Usage` / `InvalidUrl`: caller mistakes; always returned to the caller.
/// * `Transfer` / `Integrity`: retried, then returned (uploads) or logged and
///   converted into `Ok(None)` (downloads).
/// * `Download`: connectivity class; always propagates, even from downloads.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("download error: {0}")]
    Download(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("insufficient permissions for {0}")]
    PermissionDenied(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Connectivity-class failures that downloads never swallow.
    pub fn is_download_error(&self) -> bool {
        matches!(self, StorageError::Download(_))
    }

    /// Whether repeating the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Transfer(_)
            | StorageError::Integrity(_)
            | StorageError::Download(_)
            | StorageError::Io(_)
            | StorageError::Backend(_) => true,
            StorageError::Configuration(_)
            | StorageError::Usage(_)
            | StorageError::InvalidUrl(_)
            | StorageError::Unsupported(_)
            | StorageError::PermissionDenied(_)
            | StorageError::Cancelled(_)
            | StorageError::NotFound(_) => false,
        }
    }

    pub(crate) fn transfer(msg: impl std::fmt::Display) -> Self {
        StorageError::Transfer(msg.to_string())
    }
}
