//! Common types and collaborator stores for corral
//!
//! - [`crd`]: Token, User, UserAttribute and Cluster resources
//! - [`principal`]: principal ID parsing
//! - [`cache`]: two-tier read-through cache
//! - [`keyed_lock`]: per-key async mutex
//! - [`store`]: store traits, with [`memory`] and [`kube_store`] implementations
//! - [`telemetry`]: logging setup

#![deny(missing_docs)]

pub mod cache;
pub mod crd;
pub mod error;
pub mod keyed_lock;
pub mod kube_store;
pub mod memory;
pub mod principal;
pub mod store;
pub mod telemetry;

pub use error::{Result, StoreError};

/// Group every authenticated request carries
pub const ALL_AUTHENTICATED_GROUP: &str = "system:cattle:authenticated";

/// Kubernetes group every authenticated request carries
pub const SYSTEM_AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Default session cookie name
pub const DEFAULT_SESSION_COOKIE: &str = "R_SESS";
