//! Token authentication
//!
//! Resolves a `name:secret` credential to the owning user. Every decision
//! is made per request against the stores; nothing about a token's validity
//! is cached here, so disabling a token takes effect on the next request.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use corral_common::crd::{Token, User};
use corral_common::principal::{group_name, is_system_identity};
use corral_common::store::{TokenStore, UserStore};
use corral_common::{ALL_AUTHENTICATED_GROUP, DEFAULT_SESSION_COOKIE, SYSTEM_AUTHENTICATED_GROUP};
use corral_refresh::RefreshTrigger;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::credential::{token_from_request, Credential};
use super::Authenticator;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::routing::cluster_from_path;

/// Token authenticator settings
#[derive(Clone, Debug)]
pub struct AuthenticatorConfig {
    /// Name of the session cookie that may carry the credential
    pub cookie_name: String,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }
}

/// Authenticates `name:secret` tokens against the token and user stores
pub struct TokenAuthenticator {
    tokens: Arc<dyn TokenStore>,
    users: Arc<dyn UserStore>,
    refresh: Option<Arc<dyn RefreshTrigger>>,
    config: AuthenticatorConfig,
}

impl TokenAuthenticator {
    /// Create an authenticator without a refresh trigger
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        users: Arc<dyn UserStore>,
        config: AuthenticatorConfig,
    ) -> Self {
        Self {
            tokens,
            users,
            refresh: None,
            config,
        }
    }

    /// Signal `trigger` for every interactive user that authenticates
    pub fn with_refresh_trigger(mut self, trigger: Arc<dyn RefreshTrigger>) -> Self {
        self.refresh = Some(trigger);
        self
    }

    /// Resolve and validate the token a credential names
    ///
    /// `cluster` is the cluster the request addresses, if any.
    pub async fn verify_token(&self, cred: &Credential, cluster: Option<&str>) -> Result<Token> {
        let token = match self.tokens.lookup(&cred.name, &cred.secret).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(Error::Unauthenticated("invalid auth token".into())),
            Err(e) => {
                warn!(token = %cred.name, error = %e, "Token lookup failed");
                return Err(Error::Unauthenticated("failed to retrieve auth token".into()));
            }
        };

        if !token.matches(&cred.name, &cred.secret) {
            return Err(Error::Unauthenticated("invalid auth token".into()));
        }
        if !token.is_enabled() {
            return Err(Error::Unauthenticated("auth token is disabled".into()));
        }
        if token.is_expired() {
            return Err(Error::Unauthenticated("auth token has expired".into()));
        }
        if let Some(pinned) = token.pinned_cluster() {
            if cluster != Some(pinned) {
                debug!(token = %cred.name, pinned = %pinned, requested = ?cluster, "Cluster token used for another cluster");
                return Err(Error::Unauthenticated(format!(
                    "auth token is not valid for cluster {}",
                    cluster.unwrap_or("<none>")
                )));
            }
        }

        Ok(token)
    }

    async fn owner(&self, token: &Token) -> Result<User> {
        let user_id = &token.spec.user_id;
        let user = match self.users.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                return Err(Error::Unauthenticated(format!("user {user_id} not found")));
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "User lookup failed");
                return Err(Error::Unauthenticated("failed to retrieve user".into()));
            }
        };
        if !user.is_enabled() {
            return Err(Error::Unauthenticated(format!("user {user_id} is disabled")));
        }
        Ok(user)
    }

    /// Build the identity a validated token grants
    async fn identity_for(&self, token: &Token) -> Identity {
        let user_id = &token.spec.user_id;
        let provider = &token.spec.auth_provider;

        let attribute = match self.users.get_attribute(user_id).await {
            Ok(attr) => attr,
            Err(e) => {
                // Token groups are still a valid answer
                warn!(user = %user_id, error = %e, "UserAttribute lookup failed");
                None
            }
        };

        let principals = attribute
            .as_ref()
            .and_then(|a| a.groups_for(provider))
            .unwrap_or(token.spec.group_principals.as_slice());

        let mut groups: Vec<String> = Vec::with_capacity(principals.len() + 2);
        for principal in principals {
            let name = group_name(&principal.name);
            if !groups.iter().any(|g| g == name) {
                groups.push(name.to_string());
            }
        }
        for synthetic in [ALL_AUTHENTICATED_GROUP, SYSTEM_AUTHENTICATED_GROUP] {
            if !groups.iter().any(|g| g == synthetic) {
                groups.push(synthetic.to_string());
            }
        }

        let extra = attribute
            .as_ref()
            .and_then(|a| a.extras_for(provider))
            .cloned()
            .unwrap_or_default();

        Identity {
            name: user_id.clone(),
            uid: user_id.clone(),
            groups,
            extra,
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap, path: &str) -> Result<Identity> {
        let cred = token_from_request(headers, &self.config.cookie_name)?;
        let token = self.verify_token(&cred, cluster_from_path(path)).await?;
        let user = self.owner(&token).await?;
        let identity = self.identity_for(&token).await;

        if let Some(trigger) = &self.refresh {
            if !is_system_identity(&identity.name, user.spec.principal_ids.as_slice()) {
                trigger.trigger(&identity.name);
            }
        }

        debug!(user = %identity.name, token = %token.name_any(), "Token authenticated");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use axum::http::{header, HeaderValue};
    use chrono::{Duration, Utc};
    use corral_common::crd::{Principal, TokenSpec, UserAttribute, UserSpec};
    use corral_common::memory::MemoryStore;

    #[derive(Default)]
    struct RecordingTrigger(Mutex<Vec<String>>);

    impl RefreshTrigger for RecordingTrigger {
        fn trigger(&self, user_id: &str) {
            self.0.lock().unwrap().push(user_id.to_string());
        }
    }

    fn token(name: &str, secret: &str, user: &str) -> Token {
        Token::new(
            name,
            TokenSpec {
                secret: secret.to_string(),
                user_id: user.to_string(),
                auth_provider: "local".to_string(),
                is_derived: false,
                enabled: Some(true),
                cluster_name: None,
                ttl_millis: 57_600_000,
                created_at: Utc::now(),
                group_principals: vec![],
            },
        )
    }

    fn user(id: &str, principals: &[&str]) -> User {
        User::new(
            id,
            UserSpec {
                display_name: String::new(),
                username: String::new(),
                enabled: None,
                principal_ids: principals.iter().map(|p| p.to_string()).collect(),
            },
        )
    }

    fn bearer(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {value}")).unwrap(),
        );
        h
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingTrigger>, TokenAuthenticator) {
        let store = Arc::new(MemoryStore::new());
        let trigger = Arc::new(RecordingTrigger::default());
        let auth = TokenAuthenticator::new(store.clone(), store.clone(), Default::default())
            .with_refresh_trigger(trigger.clone());
        (store, trigger, auth)
    }

    fn unauthenticated_message(err: Error) -> String {
        match err {
            Error::Unauthenticated(m) => m,
            other => panic!("expected Unauthenticated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_valid_token_authenticates() {
        let (store, trigger, auth) = setup();
        store.insert_token(token("token-v2rcx", "jnb9tsecret", "u-abcdef"));
        store.insert_user(user("u-abcdef", &["local://u-abcdef"]));

        let id = auth
            .authenticate(&bearer("token-v2rcx:jnb9tsecret"), "/v3/users")
            .await
            .unwrap();
        assert_eq!(id.name, "u-abcdef");
        assert_eq!(id.uid, "u-abcdef");
        assert!(id.has_group(ALL_AUTHENTICATED_GROUP));
        assert!(id.has_group(SYSTEM_AUTHENTICATED_GROUP));
        assert_eq!(*trigger.0.lock().unwrap(), vec!["u-abcdef".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_header_must_authenticate() {
        let (_, _, auth) = setup();
        let err = auth.authenticate(&HeaderMap::new(), "/").await.unwrap_err();
        assert_eq!(unauthenticated_message(err), "must authenticate");
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (store, _, auth) = setup();
        store.insert_token(token("token-a", "right", "u-1"));
        store.insert_user(user("u-1", &[]));

        let err = auth.authenticate(&bearer("token-a:wrong"), "/").await.unwrap_err();
        assert_eq!(unauthenticated_message(err), "invalid auth token");
    }

    #[tokio::test]
    async fn test_name_mismatch_rejected() {
        let (store, _, auth) = setup();
        // The secret resolves through the index but under another name
        store.insert_token(token("token-a", "shared", "u-1"));
        store.insert_user(user("u-1", &[]));

        let err = auth.authenticate(&bearer("token-b:shared"), "/").await.unwrap_err();
        assert_eq!(unauthenticated_message(err), "invalid auth token");
    }

    #[tokio::test]
    async fn test_disabled_token_rejected() {
        let (store, _, auth) = setup();
        let mut t = token("token-a", "sec", "u-1");
        t.spec.enabled = Some(false);
        store.insert_token(t);
        store.insert_user(user("u-1", &[]));

        let err = auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap_err();
        assert!(unauthenticated_message(err).contains("disabled"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (store, _, auth) = setup();
        let mut t = token("token-a", "sec", "u-1");
        t.spec.ttl_millis = 1_000;
        t.spec.created_at = Utc::now() - Duration::seconds(10);
        store.insert_token(t);
        store.insert_user(user("u-1", &[]));

        let err = auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap_err();
        assert!(unauthenticated_message(err).contains("expired"));
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let (store, _, auth) = setup();
        let mut t = token("token-a", "sec", "u-1");
        t.spec.ttl_millis = 0;
        t.spec.created_at = Utc::now() - Duration::days(3650);
        store.insert_token(t);
        store.insert_user(user("u-1", &[]));

        assert!(auth.authenticate(&bearer("token-a:sec"), "/").await.is_ok());
    }

    #[tokio::test]
    async fn test_cluster_token_on_other_cluster_rejected() {
        let (store, _, auth) = setup();
        let mut t = token("token-a", "sec", "u-1");
        t.spec.cluster_name = Some("c-955nj".to_string());
        store.insert_token(t);
        store.insert_user(user("u-1", &[]));

        let err = auth
            .authenticate(&bearer("token-a:sec"), "/k8s/clusters/c-unknown/api")
            .await
            .unwrap_err();
        assert!(unauthenticated_message(err).contains("not valid for cluster c-unknown"));

        let err = auth.authenticate(&bearer("token-a:sec"), "/v3/users").await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));

        assert!(auth
            .authenticate(&bearer("token-a:sec"), "/k8s/clusters/c-955nj/api")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_or_disabled_user_rejected() {
        let (store, _, auth) = setup();
        store.insert_token(token("token-a", "sec", "u-1"));

        let err = auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap_err();
        assert!(unauthenticated_message(err).contains("not found"));

        let mut u = user("u-1", &[]);
        u.spec.enabled = Some(false);
        store.insert_user(u);
        let err = auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap_err();
        assert!(unauthenticated_message(err).contains("disabled"));
    }

    #[tokio::test]
    async fn test_disabling_token_invalidates_next_request() {
        let (store, _, auth) = setup();
        store.insert_token(token("token-a", "sec", "u-1"));
        store.insert_user(user("u-1", &[]));
        assert!(auth.authenticate(&bearer("token-a:sec"), "/").await.is_ok());

        let mut t = store.token("token-a").unwrap();
        t.spec.enabled = Some(false);
        store.update(t).await.unwrap();

        assert!(auth.authenticate(&bearer("token-a:sec"), "/").await.is_err());
    }

    #[tokio::test]
    async fn test_falls_back_to_live_read_when_unindexed() {
        let (store, _, auth) = setup();
        store.insert_token_unindexed(token("token-a", "sec", "u-1"));
        store.insert_user(user("u-1", &[]));

        assert!(auth.authenticate(&bearer("token-a:sec"), "/").await.is_ok());
        assert_eq!(store.token_live_reads(), 1);
    }

    #[tokio::test]
    async fn test_attribute_groups_preferred_over_token_groups() {
        let (store, _, auth) = setup();
        let mut t = token("token-a", "sec", "u-1");
        t.spec.auth_provider = "github".to_string();
        t.spec.group_principals = vec![Principal::group("github", "github_group://stale")];
        store.insert_token(t);
        store.insert_user(user("u-1", &[]));

        let mut attr = UserAttribute::for_user("u-1");
        attr.spec.group_principals.insert(
            "github".to_string(),
            vec![Principal::group("github", "github_group://fresh")],
        );
        attr.spec.extras_by_provider.insert(
            "github".to_string(),
            BTreeMap::from([("username".to_string(), vec!["octo".to_string()])]),
        );
        store.insert_attribute(attr);

        let id = auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap();
        assert!(id.has_group("github_group://fresh"));
        assert!(!id.has_group("github_group://stale"));
        assert_eq!(id.extra["username"], vec!["octo".to_string()]);
    }

    #[tokio::test]
    async fn test_token_groups_used_when_provider_not_populated() {
        let (store, _, auth) = setup();
        let mut t = token("token-a", "sec", "u-1");
        t.spec.group_principals = vec![
            Principal::group("local", "local://g-admins"),
            Principal::group("local", "local://g-admins"),
        ];
        store.insert_token(t);
        store.insert_user(user("u-1", &[]));
        store.insert_attribute(UserAttribute::for_user("u-1"));

        let id = auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap();
        assert_eq!(
            id.groups,
            vec!["g-admins", ALL_AUTHENTICATED_GROUP, SYSTEM_AUTHENTICATED_GROUP]
        );
    }

    #[tokio::test]
    async fn test_system_identities_do_not_trigger_refresh() {
        let (store, trigger, auth) = setup();
        store.insert_token(token("token-a", "sec", "system:admin"));
        store.insert_user(user("system:admin", &[]));
        store.insert_token(token("token-b", "sec-b", "u-svc"));
        store.insert_user(user("u-svc", &["system://local"]));

        auth.authenticate(&bearer("token-a:sec"), "/").await.unwrap();
        auth.authenticate(&bearer("token-b:sec-b"), "/").await.unwrap();
        assert!(trigger.0.lock().unwrap().is_empty());
    }
}
