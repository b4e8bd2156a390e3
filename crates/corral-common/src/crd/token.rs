//! Token CRD - bearer credentials issued at login or API key creation
//!
//! A token maps a public name and a secret key to a user. Clients present
//! `<name>:<secret>`; the secret is never logged.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::user::Principal;

/// Token is a bearer credential owned by a user.
///
/// Example:
/// ```yaml
/// apiVersion: management.corral.dev/v3
/// kind: Token
/// metadata:
///   name: token-v2rcx
/// spec:
///   secret: jnb9tksmnctvgbn92ngbkptblcjwg4pmfp98wqj29wk5kv85ktg59s
///   userId: u-abcdef
///   authProvider: local
///   ttlMillis: 57600000
///   createdAt: "2024-05-01T10:00:00Z"
/// ```
#[derive(CustomResource, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.corral.dev",
    version = "v3",
    kind = "Token",
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.userId"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.authProvider"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TokenSpec {
    /// Secret half of the credential
    pub secret: String,

    /// Owning user ID
    pub user_id: String,

    /// Provider the user authenticated with when the token was issued
    #[serde(default)]
    pub auth_provider: String,

    /// Derived tokens are API keys / kubeconfig tokens, not login sessions
    #[serde(default)]
    pub is_derived: bool,

    /// Tokens are enabled unless explicitly set to false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// When set, the token is only usable against this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Lifetime in milliseconds; 0 means the token never expires
    #[serde(default)]
    pub ttl_millis: i64,

    /// Issue time
    pub created_at: DateTime<Utc>,

    /// Legacy group memberships captured at issue time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_principals: Vec<Principal>,
}

impl std::fmt::Debug for TokenSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSpec")
            .field("user_id", &self.user_id)
            .field("auth_provider", &self.auth_provider)
            .field("is_derived", &self.is_derived)
            .field("enabled", &self.enabled)
            .field("cluster_name", &self.cluster_name)
            .field("ttl_millis", &self.ttl_millis)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Index key for a token secret: URL-safe base64 of its SHA-256 digest
///
/// Token indexes are keyed by this value so secret material never sits in
/// a map key in clear.
pub fn secret_index_key(secret: &str) -> String {
    use aws_lc_rs::digest::{digest, SHA256};
    let hash = digest(&SHA256, secret.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Compare two secrets without leaking timing information
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    aws_lc_rs::constant_time::verify_slices_are_equal(expected.as_bytes(), presented.as_bytes())
        .is_ok()
}

impl Token {
    /// Whether the token has been disabled
    pub fn is_enabled(&self) -> bool {
        self.spec.enabled != Some(false)
    }

    /// Whether the token's TTL has elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.spec.ttl_millis <= 0 {
            return false;
        }
        let expires_at = self.spec.created_at + Duration::milliseconds(self.spec.ttl_millis);
        now >= expires_at
    }

    /// Whether the token's TTL has elapsed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Cluster the token is pinned to, if any
    pub fn pinned_cluster(&self) -> Option<&str> {
        self.spec
            .cluster_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Token name (the public half of the credential)
    pub fn token_name(&self) -> String {
        self.name_any()
    }

    /// Index key of this token's secret
    pub fn index_key(&self) -> String {
        secret_index_key(&self.spec.secret)
    }

    /// Whether `(name, secret)` identifies exactly this token
    pub fn matches(&self, name: &str, secret: &str) -> bool {
        let name_ok = self.metadata.name.as_deref() == Some(name);
        let secret_ok = secrets_match(&self.spec.secret, secret);
        name_ok && secret_ok
    }
}
