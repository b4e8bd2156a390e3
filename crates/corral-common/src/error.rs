//! Error types for corral stores
//!
//! Every collaborator store reports failures through [`StoreError`] so the
//! request pipeline and the refresher can tell a missing object from an
//! optimistic-concurrency conflict or an unreachable backend.

use thiserror::Error;

/// Errors returned by resource stores and caches
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "Token")
        kind: &'static str,
        /// Object name or lookup key
        name: String,
    },

    /// An update lost an optimistic-concurrency race
    #[error("conflict updating {kind} {name}")]
    Conflict {
        /// Resource kind
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// The local index has not finished its initial sync
    #[error("{0} index is not synced")]
    Unavailable(&'static str),

    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a NotFound error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// Whether this error is a NotFound
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: "object",
                name: resp.message.clone(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict {
                kind: "object",
                name: resp.message.clone(),
            },
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;
