//! Caller authentication
//!
//! An [`Authenticator`] turns request headers into an [`Identity`]. The
//! production chain is [`TokenAuthenticator`] followed, when running inside
//! a cluster, by [`SaAuthenticator`](crate::sa_auth::SaAuthenticator).

mod chain;
mod credential;
mod token_auth;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::Result;
use crate::identity::Identity;

pub use chain::AuthChain;
pub use credential::{extract_bearer_token, token_from_request, Credential};
pub use token_auth::{AuthenticatorConfig, TokenAuthenticator};

/// Something that can authenticate a request
///
/// Implementations see the headers and path only; the body is never read
/// during authentication.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve the caller of a request, or fail with `Unauthenticated`
    async fn authenticate(&self, headers: &HeaderMap, path: &str) -> Result<Identity>;
}
