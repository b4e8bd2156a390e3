//! Error types for the refresher

use corral_common::StoreError;
use thiserror::Error;

/// Errors returned by refresh operations
#[derive(Debug, Error)]
pub enum RefreshError {
    /// A store read or write failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The user to refresh does not exist
    #[error("user {0} not found")]
    UserNotFound(String),

    /// The refresh worker is not running
    #[error("refresh worker stopped")]
    Stopped,
}

/// Result type alias using RefreshError
pub type Result<T> = std::result::Result<T, RefreshError>;
