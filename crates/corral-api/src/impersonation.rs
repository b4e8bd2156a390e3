//! Impersonation authorizer
//!
//! Applies `Impersonate-*` request headers to an authenticated identity.
//! Every requested attribute is authorized against the real caller, and a
//! single denial fails the whole request. Inbound impersonation headers are
//! always stripped; the proxy re-asserts the final identity downstream.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use corral_common::store::TokenStore;
use corral_common::SYSTEM_AUTHENTICATED_GROUP;
use percent_encoding::percent_decode_str;
use tracing::{debug, info};

use crate::access::{
    can_impersonate_extras, can_impersonate_group, can_impersonate_user, service_account_review,
    AccessReview, AccessReviewer,
};
use crate::error::{Error, Result};
use crate::identity::{Identity, ImpersonatedBy};
use crate::routing::cluster_from_path;
use crate::sa_auth::{parse_service_account, service_account_groups};

/// `Impersonate-User` header
pub const IMPERSONATE_USER: &str = "impersonate-user";
/// `Impersonate-Group` header
pub const IMPERSONATE_GROUP: &str = "impersonate-group";
/// `Impersonate-Uid` header
pub const IMPERSONATE_UID: &str = "impersonate-uid";
/// Prefix of `Impersonate-Extra-<key>` headers
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";
/// Extra key naming the token a request was issued for
pub const REQUEST_TOKEN_ID: &str = "requesttokenid";

/// Impersonation requested by a request's headers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImpersonationRequest {
    /// Target user
    pub user: Option<String>,
    /// Target uid
    pub uid: Option<String>,
    /// Requested groups, in header order without duplicates
    pub groups: Vec<String>,
    /// Requested extras with decoded, lowercased keys
    pub extra: BTreeMap<String, Vec<String>>,
}

impl ImpersonationRequest {
    /// Read the impersonation headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut request = Self::default();
        for (name, value) in headers {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let name = name.as_str();
            if name == IMPERSONATE_USER {
                request.user = Some(value.to_string());
            } else if name == IMPERSONATE_UID {
                request.uid = Some(value.to_string());
            } else if name == IMPERSONATE_GROUP {
                if !request.groups.iter().any(|g| g == value) {
                    request.groups.push(value.to_string());
                }
            } else if let Some(suffix) = name.strip_prefix(IMPERSONATE_EXTRA_PREFIX) {
                let key = percent_decode_str(suffix)
                    .decode_utf8_lossy()
                    .to_ascii_lowercase();
                request
                    .extra
                    .entry(key)
                    .or_default()
                    .push(value.to_string());
            }
        }
        request
    }

    /// Whether any impersonation header was present
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.uid.is_none() && self.groups.is_empty() && self.extra.is_empty()
    }

    fn request_token_ids(&self) -> &[String] {
        self.extra
            .get(REQUEST_TOKEN_ID)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Remove every `Impersonate-*` header
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("impersonate-"))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Answers access reviews on a downstream cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DownstreamReviewer: Send + Sync {
    /// Ask cluster `cluster_id` whether the review's subject is allowed
    async fn review_on_cluster(&self, cluster_id: &str, review: &AccessReview) -> Result<bool>;
}

/// Authorizes impersonation requests
pub struct Impersonator {
    reviewer: Arc<dyn AccessReviewer>,
    tokens: Arc<dyn TokenStore>,
    downstream: Option<Arc<dyn DownstreamReviewer>>,
}

fn check_failed(e: Error) -> Error {
    match e {
        Error::Forbidden(_) | Error::Ambiguous(_) => e,
        other => Error::Forbidden(format!("failed to check impersonation: {other}")),
    }
}

impl Impersonator {
    /// Create an impersonator that cannot impersonate service accounts
    pub fn new(reviewer: Arc<dyn AccessReviewer>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            reviewer,
            tokens,
            downstream: None,
        }
    }

    /// Enable service-account impersonation through downstream clusters
    pub fn with_downstream(mut self, downstream: Arc<dyn DownstreamReviewer>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    /// Resolve the identity a request acts as
    ///
    /// Returns `None` when the request does not impersonate anyone else.
    pub async fn resolve(
        &self,
        real: &Identity,
        headers: &HeaderMap,
        path: &str,
    ) -> Result<Option<Identity>> {
        let requested = ImpersonationRequest::from_headers(headers);
        if requested.is_empty() {
            return Ok(None);
        }
        if requested.request_token_ids().len() > 1 {
            return Err(Error::Ambiguous(
                "multiple requestTokenID values are not allowed".into(),
            ));
        }

        // Stray group, uid or extra headers are stripped before forwarding.
        let Some(target) = requested.user.as_deref() else {
            debug!(user = %real.name, "No Impersonate-User, identity unchanged");
            return Ok(None);
        };
        if target == real.name {
            debug!(user = %real.name, "Self-impersonation, identity unchanged");
            return Ok(None);
        }

        let mut groups = Vec::new();
        match parse_service_account(target) {
            Some((namespace, name)) => {
                self.authorize_service_account(real, namespace, name, path)
                    .await?;
                groups.extend(service_account_groups(namespace));
            }
            None => {
                let allowed = can_impersonate_user(self.reviewer.as_ref(), real, target)
                    .await
                    .map_err(check_failed)?;
                if !allowed {
                    return Err(Error::Forbidden(format!(
                        "user {} is not allowed to impersonate user {}",
                        real.name, target
                    )));
                }
            }
        }

        for group in &requested.groups {
            if real.has_group(group) {
                continue;
            }
            let allowed = can_impersonate_group(self.reviewer.as_ref(), real, group)
                .await
                .map_err(check_failed)?;
            if !allowed {
                return Err(Error::Forbidden(format!(
                    "user {} is not allowed to impersonate group {}",
                    real.name, group
                )));
            }
        }

        if !requested.extra.is_empty() {
            let allowed = can_impersonate_extras(self.reviewer.as_ref(), real, &requested.extra)
                .await
                .map_err(check_failed)?;
            if !allowed {
                return Err(Error::Forbidden(format!(
                    "user {} is not allowed to impersonate extras",
                    real.name
                )));
            }
        }

        if let Some(token_id) = requested.request_token_ids().first() {
            self.check_request_token(token_id, target).await?;
        }

        for group in requested.groups.iter().map(String::as_str).chain([SYSTEM_AUTHENTICATED_GROUP]) {
            if !groups.iter().any(|g| g == group) {
                groups.push(group.to_string());
            }
        }

        info!(user = %real.name, target = %target, "Impersonation authorized");
        Ok(Some(Identity {
            name: target.to_string(),
            uid: requested.uid.clone().unwrap_or_else(|| target.to_string()),
            groups,
            extra: requested.extra,
        }))
    }

    async fn authorize_service_account(
        &self,
        real: &Identity,
        namespace: &str,
        name: &str,
        path: &str,
    ) -> Result<()> {
        let denied = || {
            Error::Forbidden(format!(
                "user {} is not allowed to impersonate service account {}:{}",
                real.name, namespace, name
            ))
        };

        let Some(cluster_id) = cluster_from_path(path) else {
            debug!(user = %real.name, "Service account impersonation without a cluster");
            return Err(denied());
        };
        let Some(downstream) = &self.downstream else {
            return Err(denied());
        };

        let review = service_account_review(real, namespace, name);
        let allowed = downstream
            .review_on_cluster(cluster_id, &review)
            .await
            .map_err(check_failed)?;
        if allowed {
            Ok(())
        } else {
            Err(denied())
        }
    }

    async fn check_request_token(&self, token_id: &str, target: &str) -> Result<()> {
        let token = self
            .tokens
            .get(token_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("token {token_id} not found")))?;
        if token.spec.user_id != target {
            return Err(Error::Forbidden(format!(
                "request token {token_id} does not belong to user {target}"
            )));
        }
        Ok(())
    }
}

/// Middleware applying impersonation to the authenticated [`Identity`]
///
/// Must run after authentication. The real caller is kept as
/// [`ImpersonatedBy`] when the identity is replaced.
pub async fn impersonation_middleware(
    State(impersonator): State<Arc<Impersonator>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(real) = request.extensions().get::<Identity>().cloned() else {
        return Error::Unauthenticated("must authenticate".into()).into_response();
    };

    let resolved = impersonator
        .resolve(&real, request.headers(), request.uri().path())
        .await;
    strip_impersonation_headers(request.headers_mut());

    match resolved {
        Ok(Some(identity)) => {
            request.extensions_mut().insert(ImpersonatedBy(real));
            request.extensions_mut().insert(identity);
        }
        Ok(None) => {}
        Err(e) => {
            debug!(user = %real.name, error = %e, "Impersonation rejected");
            return e.into_response();
        }
    }

    next.run(request).await
}
