//! Collaborator store interfaces
//!
//! The request pipeline and the refresher only see these traits. The
//! in-memory implementations live in [`crate::memory`], the Kubernetes-backed
//! ones in [`crate::kube_store`].

use async_trait::async_trait;

use crate::crd::{Cluster, Token, User, UserAttribute};
use crate::error::Result;

/// Token reader/writer
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Resolve a presented credential
    ///
    /// Reads the secret-keyed index first and falls back to a live read by
    /// name. The returned token is not yet checked against `(name, secret)`.
    async fn lookup(&self, name: &str, secret: &str) -> Result<Option<Token>>;

    /// Live read by token name
    async fn get(&self, name: &str) -> Result<Option<Token>>;

    /// All tokens owned by `user_id`
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Token>>;

    /// Replace a token, failing with `Conflict` on a stale resource version
    async fn update(&self, token: Token) -> Result<Token>;

    /// Delete a token by name
    async fn delete(&self, name: &str) -> Result<()>;
}

/// User and UserAttribute reader/writer
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Read a user by ID
    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// All users
    async fn list_users(&self) -> Result<Vec<User>>;

    /// Read the attribute record of `user_id`
    async fn get_attribute(&self, user_id: &str) -> Result<Option<UserAttribute>>;

    /// Create an attribute record, failing with `Conflict` if it already exists
    async fn create_attribute(&self, attr: UserAttribute) -> Result<UserAttribute>;

    /// Replace an attribute record, failing with `Conflict` on a stale resource version
    async fn update_attribute(&self, attr: UserAttribute) -> Result<UserAttribute>;
}

/// Cluster reader
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read a cluster by name through the read-through cache
    async fn get(&self, name: &str) -> Result<Option<Cluster>>;
}
