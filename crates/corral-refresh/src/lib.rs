//! Background refresh of provider-derived user attributes
//!
//! Users' group memberships and extra attributes come from external
//! identity providers. The refresher re-validates them out of band so the
//! authentication path only ever reads cached `UserAttribute`s.
//!
//! Per-user state moves `stable → needs-refresh → refreshing → stable`:
//! a trigger queues the user, the worker refreshes it, and the attribute's
//! `lastRefresh` is stamped when done.

#![deny(missing_docs)]

pub mod daemon;
pub mod error;
pub mod provider;
pub mod refresher;

pub use daemon::{RefreshConfig, RefreshDaemon, RefreshHandle, RefreshTrigger};
pub use error::{RefreshError, Result};
pub use provider::{IdentityProvider, LocalProvider, ProviderError, ProviderRefresh};
pub use refresher::{RefreshReport, Refresher};
