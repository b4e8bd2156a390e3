//! Identity provider interface consumed by the refresher

use std::collections::BTreeMap;

use async_trait::async_trait;
use corral_common::crd::{Principal, User};
use corral_common::principal::LOCAL_PROVIDER;
use thiserror::Error;

/// Infrastructure failure talking to a provider
///
/// A provider error never revokes anything: the refresher fails open and
/// leaves existing attributes and tokens untouched.
#[derive(Debug, Error)]
#[error("provider {provider}: {message}")]
pub struct ProviderError {
    /// Provider name
    pub provider: String,
    /// Description of what failed
    pub message: String,
}

impl ProviderError {
    /// Create a provider error
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// What a provider reports for one user
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderRefresh {
    /// Current group memberships
    pub groups: Vec<Principal>,
    /// Extra attributes to attach to the user's identity
    pub extras: BTreeMap<String, Vec<String>>,
    /// Whether the user may still log in through this provider
    pub has_access: bool,
}

/// An external identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider name, matching principal ID prefixes and `Token.spec.authProvider`
    fn name(&self) -> &str;

    /// Providers that cannot refetch groups (e.g. assertion-only SAML) keep
    /// whatever group data was recorded at login
    fn can_refresh(&self) -> bool {
        true
    }

    /// Whether the provider has been disabled by an administrator
    async fn is_disabled(&self) -> Result<bool, ProviderError> {
        Ok(false)
    }

    /// Refetch groups and verify access for `principal_id`
    async fn refresh(
        &self,
        user: &User,
        principal_id: &str,
    ) -> Result<ProviderRefresh, ProviderError>;
}

/// Provider for locally managed users
///
/// Local users keep access for as long as they are enabled. Local accounts
/// carry no provider groups.
#[derive(Clone, Debug, Default)]
pub struct LocalProvider;

#[async_trait]
impl IdentityProvider for LocalProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    async fn refresh(
        &self,
        user: &User,
        _principal_id: &str,
    ) -> Result<ProviderRefresh, ProviderError> {
        Ok(ProviderRefresh {
            has_access: user.is_enabled(),
            ..Default::default()
        })
    }
}
