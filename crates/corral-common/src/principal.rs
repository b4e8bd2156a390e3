//! Principal ID parsing
//!
//! Principal IDs take one of the forms `<provider>_user://<id>`,
//! `<provider>_group://<id>`, `local://<id>` or `system://<id>`.

use crate::crd::PrincipalKind;

/// Scheme of locally managed principals
pub const LOCAL_SCHEME: &str = "local://";

/// Scheme of non-interactive system principals
pub const SYSTEM_SCHEME: &str = "system://";

/// Provider name of locally managed principals
pub const LOCAL_PROVIDER: &str = "local";

/// Prefix of user IDs that belong to non-interactive identities
pub const SYSTEM_USER_PREFIX: &str = "system:";

/// A parsed principal ID
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrincipalId<'a> {
    /// Provider name (`local` and `system` for the bare schemes)
    pub provider: &'a str,
    /// User or group
    pub kind: PrincipalKind,
    /// Provider-specific external ID
    pub external_id: &'a str,
}

impl<'a> PrincipalId<'a> {
    /// Parse a principal ID, returning `None` if it has no recognised scheme
    pub fn parse(id: &'a str) -> Option<Self> {
        let (scheme, external_id) = id.split_once("://")?;
        if scheme.is_empty() {
            return None;
        }
        if let Some(provider) = scheme.strip_suffix("_user") {
            return Some(Self {
                provider,
                kind: PrincipalKind::User,
                external_id,
            });
        }
        if let Some(provider) = scheme.strip_suffix("_group") {
            return Some(Self {
                provider,
                kind: PrincipalKind::Group,
                external_id,
            });
        }
        Some(Self {
            provider: scheme,
            kind: PrincipalKind::User,
            external_id,
        })
    }

    /// Whether this is a `system://` principal
    pub fn is_system(&self) -> bool {
        self.provider == "system"
    }
}

/// Group name emitted for a principal: `local://` prefixes are stripped
pub fn group_name(principal_id: &str) -> &str {
    principal_id
        .strip_prefix(LOCAL_SCHEME)
        .unwrap_or(principal_id)
}

/// Whether a user must never trigger a provider refresh
///
/// True for `system:` user IDs and for users linked to any `system://` principal.
pub fn is_system_identity<S: AsRef<str>>(user_id: &str, principal_ids: &[S]) -> bool {
    user_id.starts_with(SYSTEM_USER_PREFIX)
        || principal_ids
            .iter()
            .any(|p| p.as_ref().starts_with(SYSTEM_SCHEME))
}

/// Provider a user principal ID belongs to, if it is a user principal
pub fn user_principal_provider(principal_id: &str) -> Option<&str> {
    let parsed = PrincipalId::parse(principal_id)?;
    (parsed.kind == PrincipalKind::User && !parsed.is_system()).then_some(parsed.provider)
}
