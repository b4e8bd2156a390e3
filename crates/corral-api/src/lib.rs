//! Corral API
//!
//! The request pipeline fronting every downstream cluster. A request is
//! authenticated once here, optionally re-scoped by impersonation, checked
//! against the addressed cluster and proxied there with the caller's
//! identity asserted downstream.
//!
//! # Architecture
//!
//! ```text
//! client ──► sanitize ──► authenticate ──► impersonate ──► lookup ──► router ──► cluster
//!            (headers)    (token/SA)       (SAR checks)    (get      (cached     (dialer,
//!                                                          cluster)  proxies)    pinned TLS)
//! ```
//!
//! # Endpoints
//!
//! - `* /k8s/clusters/{id}/*` - Proxy to the cluster's API server
//! - `POST /v3/users/refresh` - Force a refresh of provider-derived attributes
//! - `GET /healthz` - Health check

#![deny(missing_docs)]

pub mod access;
pub mod auth;
pub mod error;
pub mod identity;
pub mod impersonation;
pub mod lookup;
pub mod remote;
pub mod router;
pub mod routing;
pub mod sa_auth;
pub mod sanitize;
pub mod server;

pub use access::{AccessReview, AccessReviewer, KubeAccessReviewer};
pub use auth::{AuthChain, Authenticator, AuthenticatorConfig, TokenAuthenticator};
pub use error::{Error, Result};
pub use identity::{Identity, ImpersonatedBy};
pub use impersonation::{DownstreamReviewer, Impersonator};
pub use lookup::ClusterLookup;
pub use remote::{ProxyConfig, RemoteProxyFactory, RemoteService};
pub use router::{ClusterHandler, ClusterRouter, ProxyFactory};
pub use sa_auth::SaAuthenticator;
pub use server::{app, serve, AppState, ServerConfig, TlsFiles};
