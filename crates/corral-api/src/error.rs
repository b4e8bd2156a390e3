//! Error types for the request pipeline

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use corral_common::StoreError;
use corral_refresh::RefreshError;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipeline operations
///
/// Every stage fails fast with one of these; the variant decides the HTTP
/// status written back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, invalid, expired or disabled credential
    #[error("{0}")]
    Unauthenticated(String),

    /// Impersonation or access check denied
    #[error("{0}")]
    Forbidden(String),

    /// More than one `requestTokenID` extra value
    #[error("{0}")]
    Ambiguous(String),

    /// Unknown cluster or token
    #[error("{0}")]
    NotFound(String),

    /// Proxy build, dial or transport failure
    #[error("{0}")]
    UpstreamFailure(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) | Error::Ambiguous(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::UpstreamFailure(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::Ambiguous(_) => "Ambiguous",
            Error::NotFound(_) => "NotFound",
            Error::UpstreamFailure(_) => "UpstreamFailure",
            Error::Internal(_) => "ServerError",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "type": "error",
            "status": status.as_u16(),
            "code": self.code(),
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Error::NotFound(e.to_string()),
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<RefreshError> for Error {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::UserNotFound(_) => Error::NotFound(e.to_string()),
            RefreshError::Store(inner) => inner.into(),
            RefreshError::Stopped => Error::Internal(e.to_string()),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
