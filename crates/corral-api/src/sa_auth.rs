//! ServiceAccount token validation via Kubernetes TokenReview API
//!
//! In-cluster callers present a raw ServiceAccount JWT instead of a
//! `name:secret` token. [`SaAuthenticator`] submits it to the TokenReview
//! API of the cluster corral runs in.
//!
//! # Usage
//!
//! ```rust,ignore
//! let client = kube::Client::try_default().await?;
//! let chain = AuthChain::default()
//!     .with(Arc::new(token_authenticator))
//!     .with(Arc::new(SaAuthenticator::new(client)));
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

use crate::auth::{extract_bearer_token, Authenticator};
use crate::error::{Error, Result};
use crate::identity::Identity;

/// Username prefix of Kubernetes service accounts
pub const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// Group every service account belongs to
pub const SERVICE_ACCOUNTS_GROUP: &str = "system:serviceaccounts";

/// Split `system:serviceaccount:<namespace>:<name>` into its parts
///
/// # Examples
///
/// ```
/// use corral_api::sa_auth::parse_service_account;
///
/// assert_eq!(
///     parse_service_account("system:serviceaccount:kube-system:default"),
///     Some(("kube-system", "default"))
/// );
/// assert_eq!(parse_service_account("u-abcdef"), None);
/// ```
pub fn parse_service_account(username: &str) -> Option<(&str, &str)> {
    let rest = username.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
    let (namespace, name) = rest.split_once(':')?;
    if namespace.is_empty() || name.is_empty() || name.contains(':') {
        return None;
    }
    Some((namespace, name))
}

/// Groups Kubernetes assigns to a service account in `namespace`
pub fn service_account_groups(namespace: &str) -> [String; 2] {
    [
        SERVICE_ACCOUNTS_GROUP.to_string(),
        format!("{SERVICE_ACCOUNTS_GROUP}:{namespace}"),
    ]
}

/// ServiceAccount token authenticator using the TokenReview API
pub struct SaAuthenticator {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl SaAuthenticator {
    /// Create a new ServiceAccount authenticator
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Create an authenticator that requires specific audiences
    pub fn with_audiences(client: Client, audiences: Vec<String>) -> Self {
        Self {
            client,
            audiences: Some(audiences),
        }
    }

    /// Validate a ServiceAccount token using the TokenReview API
    pub async fn validate(&self, token: &str) -> Result<Identity> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| Error::Internal(format!("TokenReview API error: {e}")))?;

        let status = result
            .status
            .ok_or_else(|| Error::Internal("TokenReview returned no status".into()))?;

        identity_from_status(&status)
    }
}

/// Extract the caller identity from a TokenReview status
fn identity_from_status(status: &TokenReviewStatus) -> Result<Identity> {
    if !status.authenticated.unwrap_or(false) {
        let message = status
            .error
            .as_deref()
            .unwrap_or("token authentication failed");
        return Err(Error::Unauthenticated(message.to_string()));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| Error::Internal("TokenReview authenticated but no user info".into()))?;

    let name = user
        .username
        .clone()
        .ok_or_else(|| Error::Internal("TokenReview user has no username".into()))?;

    let extra: BTreeMap<String, Vec<String>> = user.extra.clone().unwrap_or_default();

    debug!(username = %name, groups = ?user.groups, "TokenReview validated ServiceAccount token");

    Ok(Identity {
        uid: user.uid.clone().unwrap_or_else(|| name.clone()),
        name,
        groups: user.groups.clone().unwrap_or_default(),
        extra,
    })
}

#[async_trait]
impl Authenticator for SaAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap, _path: &str) -> Result<Identity> {
        let token = extract_bearer_token(headers)
            .ok_or_else(|| Error::Unauthenticated("must authenticate".into()))?;
        self.validate(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo;

    #[test]
    fn test_identity_from_authenticated_status() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(UserInfo {
                username: Some("system:serviceaccount:default:test-sa".to_string()),
                groups: Some(vec![
                    "system:serviceaccounts".to_string(),
                    "system:serviceaccounts:default".to_string(),
                ]),
                uid: Some("8d7a".to_string()),
                extra: Some(BTreeMap::from([(
                    "authentication.kubernetes.io/pod-name".to_string(),
                    vec!["web-0".to_string()],
                )])),
            }),
            error: None,
            audiences: None,
        };

        let id = identity_from_status(&status).unwrap();
        assert_eq!(id.name, "system:serviceaccount:default:test-sa");
        assert_eq!(id.uid, "8d7a");
        assert!(id.has_group("system:serviceaccounts:default"));
        assert_eq!(
            id.extra["authentication.kubernetes.io/pod-name"],
            vec!["web-0".to_string()]
        );
    }

    #[test]
    fn test_identity_from_rejected_status() {
        let status = TokenReviewStatus {
            authenticated: Some(false),
            user: None,
            error: Some("token expired".to_string()),
            audiences: None,
        };

        let err = identity_from_status(&status).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(ref m) if m == "token expired"));
    }

    #[test]
    fn test_identity_without_username_is_internal() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(UserInfo::default()),
            error: None,
            audiences: None,
        };
        assert!(matches!(
            identity_from_status(&status),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_parse_service_account() {
        assert_eq!(
            parse_service_account("system:serviceaccount:kube-system:default"),
            Some(("kube-system", "default"))
        );
        assert_eq!(parse_service_account("system:serviceaccount:ns"), None);
        assert_eq!(parse_service_account("system:serviceaccount::sa"), None);
        assert_eq!(parse_service_account("system:serviceaccount:ns:a:b"), None);
        assert_eq!(parse_service_account("system:admin"), None);
    }

    #[test]
    fn test_service_account_groups() {
        assert_eq!(
            service_account_groups("team-a"),
            [
                "system:serviceaccounts".to_string(),
                "system:serviceaccounts:team-a".to_string()
            ]
        );
    }
}
