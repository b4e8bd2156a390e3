//! Inbound header sanitizing
//!
//! A client could list `Impersonate-User` in `Connection` so a hop-by-hop
//! aware proxy drops the header after it has been authorized, or smuggle it
//! past a component that only inspects end-to-end headers. Any
//! `impersonate-*` token is removed from `Connection` before the request
//! reaches the pipeline.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

const IMPERSONATE_PREFIX: &str = "impersonate-";

/// Strip `impersonate-*` tokens from every `Connection` header
///
/// Headers left with no tokens are removed entirely.
pub fn sanitize_connection(headers: &mut HeaderMap) {
    let values: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        return;
    }

    let mut dirty = false;
    let kept: Vec<&str> = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter(|token| {
            let smuggled = token.to_ascii_lowercase().starts_with(IMPERSONATE_PREFIX);
            dirty |= smuggled;
            !smuggled
        })
        .collect();

    if !dirty {
        return;
    }
    debug!("Removed impersonation tokens from Connection header");

    headers.remove(header::CONNECTION);
    if kept.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&kept.join(", ")) {
        headers.insert(header::CONNECTION, value);
    }
}

/// Middleware running [`sanitize_connection`] on every request
pub async fn sanitize_middleware(mut request: Request<Body>, next: Next) -> Response {
    sanitize_connection(request.headers_mut());
    next.run(request).await
}
