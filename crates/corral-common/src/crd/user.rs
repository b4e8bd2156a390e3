//! User and UserAttribute CRDs
//!
//! A `User` is the persisted identity a token resolves to. Its
//! `UserAttribute` caches the group memberships and extra attributes each
//! identity provider reported at the last refresh.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether a principal names a user or a group
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    /// A user principal
    #[default]
    User,
    /// A group principal
    Group,
}

/// Reference to an identity held by an external provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Principal ID, e.g. `github_group://1234` or `local://u-abcdef`
    pub name: String,

    /// Human readable name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,

    /// Provider that owns this principal
    #[serde(default)]
    pub provider: String,

    /// User or group
    #[serde(default)]
    pub kind: PrincipalKind,
}

impl Principal {
    /// Build a group principal for `provider`
    pub fn group(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: String::new(),
            provider: provider.into(),
            kind: PrincipalKind::Group,
        }
    }
}

/// User is a persisted identity.
///
/// The user ID is the object name. `principalIds` lists every external
/// identity the user is linked to.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.corral.dev",
    version = "v3",
    kind = "User",
    printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Human readable name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,

    /// Local login name, empty for users that only exist through a provider
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Users are enabled unless explicitly set to false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Linked principal IDs
    #[serde(default)]
    pub principal_ids: Vec<String>,
}

impl User {
    /// Whether the user has been disabled
    pub fn is_enabled(&self) -> bool {
        self.spec.enabled != Some(false)
    }
}

/// UserAttribute caches provider-derived attributes for one user.
///
/// The object name equals the user ID.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.corral.dev",
    version = "v3",
    kind = "UserAttribute",
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.userId"}"#,
    printcolumn = r#"{"name":"LastRefresh","type":"date","jsonPath":".spec.lastRefresh"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserAttributeSpec {
    /// Owning user ID
    pub user_id: String,

    /// Group memberships keyed by provider name
    #[serde(default)]
    pub group_principals: BTreeMap<String, Vec<Principal>>,

    /// Extra attributes keyed by provider name, then attribute key
    #[serde(default)]
    pub extras_by_provider: BTreeMap<String, BTreeMap<String, Vec<String>>>,

    /// Time of the last completed refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,

    /// Set when a refresh has been requested but not yet completed
    #[serde(default)]
    pub needs_refresh: bool,
}

impl UserAttribute {
    /// Empty attribute record for `user_id`
    pub fn for_user(user_id: &str) -> Self {
        Self::new(
            user_id,
            UserAttributeSpec {
                user_id: user_id.to_string(),
                ..Default::default()
            },
        )
    }

    /// Groups recorded for `provider`, `None` when the provider was never populated
    pub fn groups_for(&self, provider: &str) -> Option<&[Principal]> {
        self.spec
            .group_principals
            .get(provider)
            .map(|groups| groups.as_slice())
    }

    /// Extras recorded for `provider`
    pub fn extras_for(&self, provider: &str) -> Option<&BTreeMap<String, Vec<String>>> {
        self.spec.extras_by_provider.get(provider)
    }
}
