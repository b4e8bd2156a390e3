//! Per-user attribute refresh
//!
//! Re-validates one user against every configured identity provider,
//! rewrites the user's `UserAttribute`, and revokes tokens when access has
//! been lost. Provider failures never revoke anything.

use std::sync::Arc;

use chrono::{Duration, Utc};
use corral_common::crd::{Token, User, UserAttribute};
use corral_common::principal::{is_system_identity, user_principal_provider};
use corral_common::store::{TokenStore, UserStore};
use corral_common::StoreError;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{RefreshError, Result};
use crate::provider::IdentityProvider;

/// Outcome of refreshing one user
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// User that was considered
    pub user_id: String,
    /// True when the refresh was skipped (recent refresh or system identity)
    pub skipped: bool,
    /// Whether any provider still grants access
    pub has_access: bool,
    /// Providers that could not be reached
    pub provider_errors: usize,
    /// Login tokens deleted because their provider revoked access
    pub revoked_login_tokens: usize,
    /// Derived tokens disabled because no provider grants access
    pub disabled_derived_tokens: usize,
}

impl RefreshReport {
    fn skipped(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            skipped: true,
            ..Default::default()
        }
    }
}

/// First principal ID of `user` that belongs to `provider`
pub fn principal_for_provider<'a>(user: &'a User, provider: &str) -> Option<&'a str> {
    user.spec
        .principal_ids
        .iter()
        .map(String::as_str)
        .find(|id| user_principal_provider(id) == Some(provider))
}

/// Refreshes provider-derived attributes for single users
#[derive(Clone)]
pub struct Refresher {
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenStore>,
    providers: Vec<Arc<dyn IdentityProvider>>,
    max_age: Duration,
}

impl Refresher {
    /// Create a refresher over the given stores and providers
    ///
    /// Non-forced refreshes are skipped for users refreshed within `max_age`.
    pub fn new(
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn TokenStore>,
        providers: Vec<Arc<dyn IdentityProvider>>,
        max_age: std::time::Duration,
    ) -> Self {
        Self {
            users,
            tokens,
            providers,
            max_age: Duration::from_std(max_age).unwrap_or_else(|_| Duration::days(36_500)),
        }
    }

    /// User store this refresher writes to
    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    /// Refresh one user
    ///
    /// Unless `force` is set, a user whose attributes were refreshed within
    /// the max age and are not flagged `needsRefresh` is skipped.
    #[instrument(skip(self))]
    pub async fn refresh_user(&self, user_id: &str, force: bool) -> Result<RefreshReport> {
        let user = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| RefreshError::UserNotFound(user_id.to_string()))?;

        if is_system_identity(user_id, user.spec.principal_ids.as_slice()) {
            debug!("System identity, not refreshing");
            return Ok(RefreshReport::skipped(user_id));
        }

        let existing = self.users.get_attribute(user_id).await?;
        if !force {
            if let Some(attr) = &existing {
                let fresh = attr.spec.last_refresh.is_some_and(|at| {
                    Utc::now()
                        .checked_sub_signed(self.max_age)
                        .map_or(true, |cutoff| at > cutoff)
                });
                if fresh && !attr.spec.needs_refresh {
                    debug!("Refreshed recently, skipping");
                    return Ok(RefreshReport::skipped(user_id));
                }
            }
        }

        let exists = existing.is_some();
        let mut attr = existing.unwrap_or_else(|| UserAttribute::for_user(user_id));
        let report = self.refresh_attributes(&user, &mut attr).await?;

        attr.spec.last_refresh = Some(Utc::now());
        attr.spec.needs_refresh = false;
        self.save_attribute(exists, attr).await?;

        info!(
            has_access = report.has_access,
            provider_errors = report.provider_errors,
            revoked = report.revoked_login_tokens,
            disabled = report.disabled_derived_tokens,
            "User refreshed"
        );
        Ok(report)
    }

    /// Re-derive `attr` from the providers and revoke tokens as needed
    pub async fn refresh_attributes(
        &self,
        user: &User,
        attr: &mut UserAttribute,
    ) -> Result<RefreshReport> {
        let user_id = user.name_any();
        let mut report = RefreshReport {
            user_id: user_id.clone(),
            ..Default::default()
        };

        for provider in &self.providers {
            let name = provider.name().to_string();

            let Some(principal_id) = principal_for_provider(user, &name) else {
                if provider.can_refresh() {
                    attr.spec.group_principals.insert(name.clone(), Vec::new());
                }
                attr.spec.extras_by_provider.remove(&name);
                continue;
            };

            match provider.is_disabled().await {
                Ok(false) => {}
                Ok(true) => {
                    info!(provider = %name, "Provider disabled, revoking access");
                    self.lose_access(&user_id, &name, attr, &mut report).await?;
                    continue;
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Could not determine provider state");
                    report.provider_errors += 1;
                    continue;
                }
            }

            if !provider.can_refresh() {
                debug!(provider = %name, "Provider cannot refresh, keeping recorded groups");
                report.has_access = true;
                continue;
            }

            match provider.refresh(user, principal_id).await {
                Ok(refreshed) if refreshed.has_access => {
                    attr.spec
                        .group_principals
                        .insert(name.clone(), refreshed.groups);
                    if refreshed.extras.is_empty() {
                        attr.spec.extras_by_provider.remove(&name);
                    } else {
                        attr.spec
                            .extras_by_provider
                            .insert(name.clone(), refreshed.extras);
                    }
                    report.has_access = true;
                }
                Ok(_) => {
                    info!(provider = %name, "User lost access through provider");
                    self.lose_access(&user_id, &name, attr, &mut report).await?;
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Provider refresh failed, keeping attributes");
                    report.provider_errors += 1;
                }
            }
        }

        if !report.has_access && report.provider_errors == 0 {
            report.disabled_derived_tokens = self.disable_derived_tokens(&user_id).await?;
        }
        Ok(report)
    }

    async fn lose_access(
        &self,
        user_id: &str,
        provider: &str,
        attr: &mut UserAttribute,
        report: &mut RefreshReport,
    ) -> Result<()> {
        attr.spec
            .group_principals
            .insert(provider.to_string(), Vec::new());
        attr.spec.extras_by_provider.remove(provider);
        report.revoked_login_tokens += self.revoke_login_tokens(user_id, provider).await?;
        Ok(())
    }

    async fn revoke_login_tokens(&self, user_id: &str, provider: &str) -> Result<usize> {
        let tokens = self.tokens.list_for_user(user_id).await?;
        let mut revoked = 0;
        for token in tokens
            .iter()
            .filter(|t| !t.spec.is_derived && t.spec.auth_provider == provider)
        {
            let name = token.name_any();
            match self.tokens.delete(&name).await {
                Ok(()) => revoked += 1,
                Err(StoreError::NotFound { .. }) => debug!(token = %name, "Token already gone"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(revoked)
    }

    async fn disable_derived_tokens(&self, user_id: &str) -> Result<usize> {
        let tokens = self.tokens.list_for_user(user_id).await?;
        let mut disabled = 0;
        for token in tokens
            .into_iter()
            .filter(|t| t.spec.is_derived && t.is_enabled())
        {
            let name = token.name_any();
            if self.disable_token(token).await? {
                disabled += 1;
            } else {
                debug!(token = %name, "Token changed concurrently, leaving it to the next refresh");
            }
        }
        Ok(disabled)
    }

    async fn disable_token(&self, mut token: Token) -> Result<bool> {
        token.spec.enabled = Some(false);
        match self.tokens.update(token).await {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_attribute(&self, exists: bool, attr: UserAttribute) -> Result<()> {
        let result = if exists {
            self.users.update_attribute(attr).await
        } else {
            self.users.create_attribute(attr).await
        };
        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { name, .. }) => {
                debug!(attribute = %name, "UserAttribute already advanced by another refresh");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderRefresh};
    use async_trait::async_trait;
    use corral_common::crd::{Principal, TokenSpec, UserSpec};
    use corral_common::memory::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const USER: &str = "user-abcde";

    /// Provider whose answers are fixed per test
    pub(crate) struct FakeProvider {
        pub name: &'static str,
        pub can_refresh: bool,
        pub disabled: std::result::Result<bool, &'static str>,
        pub access: std::result::Result<bool, &'static str>,
        pub groups: Vec<Principal>,
        pub calls: AtomicUsize,
    }

    impl FakeProvider {
        pub(crate) fn new(name: &'static str) -> Self {
            Self {
                name,
                can_refresh: true,
                disabled: Ok(false),
                access: Ok(true),
                groups: vec![],
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn can_refresh(&self) -> bool {
            self.can_refresh
        }

        async fn is_disabled(&self) -> std::result::Result<bool, ProviderError> {
            self.disabled.map_err(|m| ProviderError::new(self.name, m))
        }

        async fn refresh(
            &self,
            user: &User,
            principal_id: &str,
        ) -> std::result::Result<ProviderRefresh, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let has_access = self.access.map_err(|m| ProviderError::new(self.name, m))?;
            let mut extras = BTreeMap::new();
            extras.insert("principalid".to_string(), vec![principal_id.to_string()]);
            extras.insert("username".to_string(), vec![user.spec.username.clone()]);
            Ok(ProviderRefresh {
                groups: self.groups.clone(),
                extras,
                has_access,
            })
        }
    }

    pub(crate) fn user(principals: &[&str]) -> User {
        User::new(
            USER,
            UserSpec {
                display_name: String::new(),
                username: "admin".to_string(),
                enabled: None,
                principal_ids: principals.iter().map(|p| p.to_string()).collect(),
            },
        )
    }

    pub(crate) fn token(name: &str, provider: &str, derived: bool) -> Token {
        Token::new(
            name,
            TokenSpec {
                secret: format!("{name}-secret"),
                user_id: USER.to_string(),
                auth_provider: provider.to_string(),
                is_derived: derived,
                enabled: None,
                cluster_name: None,
                ttl_millis: 0,
                created_at: Utc::now(),
                group_principals: vec![],
            },
        )
    }

    fn refresher(store: &Arc<MemoryStore>, providers: Vec<Arc<dyn IdentityProvider>>) -> Refresher {
        Refresher::new(
            store.clone(),
            store.clone(),
            providers,
            std::time::Duration::from_secs(3600),
        )
    }

    fn setup(principals: &[&str], tokens: &[Token]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(principals));
        for t in tokens {
            store.insert_token(t.clone());
        }
        store
    }

    // ===== Access Tests =====

    #[tokio::test]
    async fn test_local_user_keeps_tokens_and_gets_extras() {
        let store = setup(
            &["local://user-abcde"],
            &[token("login", "local", false), token("derived", "local", true)],
        );
        let r = refresher(&store, vec![Arc::new(FakeProvider::new("local"))]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(report.has_access);
        assert_eq!(report.revoked_login_tokens, 0);
        assert_eq!(report.disabled_derived_tokens, 0);

        let attr = store.attribute(USER).unwrap();
        assert_eq!(attr.groups_for("local"), Some(&[][..]));
        assert_eq!(
            attr.extras_for("local").unwrap()["principalid"],
            vec!["local://user-abcde".to_string()]
        );
        assert!(attr.spec.last_refresh.is_some());
        assert!(store.token("derived").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_lost_access_deletes_login_and_disables_derived() {
        let store = setup(
            &["local://user-abcde"],
            &[token("login", "local", false), token("derived", "local", true)],
        );
        let mut provider = FakeProvider::new("local");
        provider.access = Ok(false);
        let r = refresher(&store, vec![Arc::new(provider)]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(!report.has_access);
        assert_eq!(report.revoked_login_tokens, 1);
        assert_eq!(report.disabled_derived_tokens, 1);
        assert!(store.token("login").is_none());
        assert!(!store.token("derived").unwrap().is_enabled());
        assert!(store.attribute(USER).unwrap().extras_for("local").is_none());
    }

    #[tokio::test]
    async fn test_disabled_provider_revokes() {
        let store = setup(
            &["local://user-abcde"],
            &[token("login", "local", false), token("derived", "local", true)],
        );
        let mut provider = FakeProvider::new("local");
        provider.disabled = Ok(true);
        let provider = Arc::new(provider);
        let r = refresher(&store, vec![provider.clone()]);

        r.refresh_user(USER, true).await.unwrap();
        assert!(store.token("login").is_none());
        assert!(!store.token("derived").unwrap().is_enabled());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_error_fails_open() {
        let store = setup(
            &["local://user-abcde"],
            &[token("login", "local", false), token("derived", "local", true)],
        );
        let mut provider = FakeProvider::new("local");
        provider.disabled = Err("unable to determine if provider was disabled");
        let r = refresher(&store, vec![Arc::new(provider)]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert_eq!(report.provider_errors, 1);
        assert_eq!(report.disabled_derived_tokens, 0);
        assert!(store.token("login").is_some());
        assert!(store.token("derived").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_refresh_error_in_one_provider_blocks_derived_disable() {
        let store = setup(
            &["local://user-abcde", "github_user://7"],
            &[token("derived", "github", true)],
        );
        let mut local = FakeProvider::new("local");
        local.access = Ok(false);
        let mut github = FakeProvider::new("github");
        github.access = Err("connection refused");
        let r = refresher(&store, vec![Arc::new(local), Arc::new(github)]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(!report.has_access);
        assert_eq!(report.provider_errors, 1);
        assert!(store.token("derived").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_lost_access_only_revokes_that_providers_login_tokens() {
        let store = setup(
            &["local://user-abcde", "github_user://7"],
            &[token("gh-login", "github", false), token("local-login", "local", false)],
        );
        let mut github = FakeProvider::new("github");
        github.access = Ok(false);
        let r = refresher(&store, vec![Arc::new(FakeProvider::new("local")), Arc::new(github)]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(report.has_access);
        assert!(store.token("gh-login").is_none());
        assert!(store.token("local-login").is_some());
    }

    // ===== Provider Capability Tests =====

    #[tokio::test]
    async fn test_cannot_refresh_provider_preserves_groups() {
        let store = setup(&["shibboleth_user://user1"], &[]);
        let mut existing = UserAttribute::for_user(USER);
        existing.spec.group_principals.insert(
            "shibboleth".to_string(),
            vec![Principal::group("shibboleth", "shibboleth_group://ops")],
        );
        store.insert_attribute(existing);

        let mut shib = FakeProvider::new("shibboleth");
        shib.can_refresh = false;
        let shib = Arc::new(shib);
        let r = refresher(&store, vec![shib.clone()]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(report.has_access);
        assert_eq!(shib.calls.load(Ordering::SeqCst), 0);
        let attr = store.attribute(USER).unwrap();
        assert_eq!(attr.groups_for("shibboleth").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refreshed_groups_replace_recorded_groups() {
        let store = setup(&["github_user://7"], &[]);
        let mut github = FakeProvider::new("github");
        github.groups = vec![Principal::group("github", "github_group://admins")];
        let r = refresher(&store, vec![Arc::new(github)]);

        r.refresh_user(USER, true).await.unwrap();
        let attr = store.attribute(USER).unwrap();
        assert_eq!(attr.groups_for("github").unwrap()[0].name, "github_group://admins");
    }

    #[tokio::test]
    async fn test_principal_for_provider_picks_first_match() {
        let u = user(&["local://u", "github_user://1", "github_user://2"]);
        assert_eq!(principal_for_provider(&u, "github"), Some("github_user://1"));
        assert_eq!(principal_for_provider(&u, "local"), Some("local://u"));
        assert_eq!(principal_for_provider(&u, "okta"), None);
    }

    // ===== Rate Limit Tests =====

    #[tokio::test]
    async fn test_recent_refresh_skipped_unless_forced() {
        let store = setup(&["local://user-abcde"], &[]);
        let provider = Arc::new(FakeProvider::new("local"));
        let r = refresher(&store, vec![provider.clone()]);

        r.refresh_user(USER, false).await.unwrap();
        let second = r.refresh_user(USER, false).await.unwrap();
        assert!(second.skipped);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let forced = r.refresh_user(USER, true).await.unwrap();
        assert!(!forced.skipped);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_needs_refresh_flag_overrides_max_age() {
        let store = setup(&["local://user-abcde"], &[]);
        let mut attr = UserAttribute::for_user(USER);
        attr.spec.last_refresh = Some(Utc::now());
        attr.spec.needs_refresh = true;
        store.insert_attribute(attr);
        let r = refresher(&store, vec![Arc::new(FakeProvider::new("local"))]);

        let report = r.refresh_user(USER, false).await.unwrap();
        assert!(!report.skipped);
        assert!(!store.attribute(USER).unwrap().spec.needs_refresh);
    }

    #[tokio::test]
    async fn test_system_identity_never_refreshed() {
        let store = setup(&["system://c-955nj"], &[token("derived", "local", true)]);
        let provider = Arc::new(FakeProvider::new("local"));
        let r = refresher(&store, vec![provider.clone()]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(report.skipped);
        assert!(store.attribute(USER).is_none());
        assert!(store.token("derived").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_unknown_user_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let r = refresher(&store, vec![]);
        let err = r.refresh_user("nobody", true).await.unwrap_err();
        assert!(matches!(err, RefreshError::UserNotFound(_)));
    }

    // ===== Write Conflict Tests =====

    /// Provider that rewrites the user's attribute while it is being refreshed
    struct ConcurrentAttributeWriter {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl IdentityProvider for ConcurrentAttributeWriter {
        fn name(&self) -> &str {
            "local"
        }

        fn can_refresh(&self) -> bool {
            true
        }

        async fn is_disabled(&self) -> std::result::Result<bool, ProviderError> {
            Ok(false)
        }

        async fn refresh(
            &self,
            _user: &User,
            _principal_id: &str,
        ) -> std::result::Result<ProviderRefresh, ProviderError> {
            let mut attr = self.store.attribute(USER).unwrap();
            attr.spec.needs_refresh = true;
            self.store.update_attribute(attr).await.unwrap();
            Ok(ProviderRefresh {
                groups: vec![],
                extras: BTreeMap::new(),
                has_access: true,
            })
        }
    }

    /// Token store whose tokens change between listing and writing
    struct ConcurrentTokenWriter {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl TokenStore for ConcurrentTokenWriter {
        async fn lookup(&self, name: &str, secret: &str) -> corral_common::Result<Option<Token>> {
            self.store.lookup(name, secret).await
        }

        async fn get(&self, name: &str) -> corral_common::Result<Option<Token>> {
            TokenStore::get(self.store.as_ref(), name).await
        }

        async fn list_for_user(&self, user_id: &str) -> corral_common::Result<Vec<Token>> {
            let listed = self.store.list_for_user(user_id).await?;
            for token in &listed {
                self.store.update(token.clone()).await?;
            }
            Ok(listed)
        }

        async fn update(&self, token: Token) -> corral_common::Result<Token> {
            self.store.update(token).await
        }

        async fn delete(&self, name: &str) -> corral_common::Result<()> {
            self.store.delete(name).await
        }
    }

    #[tokio::test]
    async fn test_attribute_write_conflict_is_benign() {
        let store = setup(&["local://user-abcde"], &[]);
        store.insert_attribute(UserAttribute::for_user(USER));
        let provider = ConcurrentAttributeWriter {
            store: store.clone(),
        };
        let r = refresher(&store, vec![Arc::new(provider)]);

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(report.has_access);

        // The concurrent write wins
        let attr = store.attribute(USER).unwrap();
        assert!(attr.spec.needs_refresh);
        assert!(attr.spec.last_refresh.is_none());
    }

    #[tokio::test]
    async fn test_token_write_conflict_is_benign() {
        let store = setup(&["local://user-abcde"], &[token("derived", "local", true)]);
        let mut provider = FakeProvider::new("local");
        provider.access = Ok(false);
        let r = Refresher::new(
            store.clone(),
            Arc::new(ConcurrentTokenWriter {
                store: store.clone(),
            }),
            vec![Arc::new(provider)],
            std::time::Duration::from_secs(3600),
        );

        let report = r.refresh_user(USER, true).await.unwrap();
        assert!(!report.has_access);
        assert_eq!(report.disabled_derived_tokens, 0);
        assert!(store.token("derived").unwrap().is_enabled());
    }
}
