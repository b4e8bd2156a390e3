//! Authentication chain with fallback support
//!
//! Tries each [`Authenticator`] in order and returns the first identity
//! produced, or the last error when every link fails.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tracing::debug;

use super::Authenticator;
use crate::error::{Error, Result};
use crate::identity::Identity;

/// Ordered list of authenticators
#[derive(Clone, Default)]
pub struct AuthChain {
    links: Vec<Arc<dyn Authenticator>>,
}

impl AuthChain {
    /// Create a chain from its links, tried first to last
    pub fn new(links: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { links }
    }

    /// Append a link
    pub fn with(mut self, link: Arc<dyn Authenticator>) -> Self {
        self.links.push(link);
        self
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the chain has no links and rejects everything
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[async_trait]
impl Authenticator for AuthChain {
    async fn authenticate(&self, headers: &HeaderMap, path: &str) -> Result<Identity> {
        let mut last_error: Option<Error> = None;

        for (i, link) in self.links.iter().enumerate() {
            match link.authenticate(headers, path).await {
                Ok(identity) => {
                    debug!(link = i, user = %identity.name, "Authentication succeeded");
                    return Ok(identity);
                }
                Err(e) => {
                    debug!(link = i, error = %e, "Authentication failed, trying next link");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Unauthenticated("must authenticate".into())))
    }
}
