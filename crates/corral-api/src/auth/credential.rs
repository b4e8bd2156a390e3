//! Credential extraction
//!
//! A credential is `<token name>:<token secret>`, carried either as a bearer
//! token or in the session cookie.

use std::fmt;

use axum::http::{header, HeaderMap};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// A presented `name:secret` pair
pub struct Credential {
    /// Token name
    pub name: String,
    /// Token secret
    pub secret: Zeroizing<String>,
}

impl Credential {
    /// Split a `name:secret` value
    ///
    /// Returns `None` when there is no `:` or either half is empty.
    pub fn parse(value: &str) -> Option<Self> {
        let (name, secret) = value.split_once(':')?;
        if name.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            secret: Zeroizing::new(secret.to_string()),
        })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn cookie_value<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty())
}

/// Read the caller's credential from the bearer header or the session cookie
///
/// The bearer header wins when both are present.
pub fn token_from_request(headers: &HeaderMap, cookie_name: &str) -> Result<Credential> {
    let raw = extract_bearer_token(headers)
        .or_else(|| cookie_value(headers, cookie_name))
        .ok_or_else(|| Error::Unauthenticated("must authenticate".into()))?;

    Credential::parse(raw).ok_or_else(|| Error::Unauthenticated("invalid auth token format".into()))
}
