//! Custom Resource Definitions for the corral management plane
//!
//! These are the persisted identities and clusters the request pipeline reads.
//! The pipeline never creates clusters; tokens and user attributes are mutated
//! only by the refresher.

mod cluster;
mod token;
mod user;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use token::{secret_index_key, secrets_match, Token, TokenSpec};
pub use user::{Principal, PrincipalKind, User, UserAttribute, UserAttributeSpec, UserSpec};

/// API group shared by every corral resource
pub const API_GROUP: &str = "management.corral.dev";

/// API version shared by every corral resource
pub const API_VERSION: &str = "v3";
