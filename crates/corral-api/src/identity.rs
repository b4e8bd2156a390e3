//! Request-scoped caller identity
//!
//! Produced by an [`Authenticator`](crate::auth::Authenticator), possibly
//! replaced by the impersonation layer, and carried in request extensions
//! until the request is proxied.

use std::collections::BTreeMap;

/// Identity of the caller a request acts as
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    /// User name
    pub name: String,
    /// Stable user ID
    pub uid: String,
    /// Group names
    pub groups: Vec<String>,
    /// Extra attributes, keyed by attribute name
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Identity {
    /// Identity whose name and uid are both `user_id`
    pub fn user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            uid: user_id.clone(),
            name: user_id,
            ..Default::default()
        }
    }

    /// Builder-style group list
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the identity holds `group`
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// The authenticated caller, kept alongside an impersonated [`Identity`]
#[derive(Clone, Debug)]
pub struct ImpersonatedBy(pub Identity);
