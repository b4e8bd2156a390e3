//! In-memory stores
//!
//! Backs single-process deployments and tests. Writes bump a resource
//! version so optimistic concurrency behaves like the API server: an update
//! carrying a stale `resourceVersion` fails with `Conflict`.
//!
//! The token index is kept separately from the objects so callers can make
//! it lag behind (see [`MemoryStore::insert_token_unindexed`] and
//! [`MemoryStore::set_index_synced`]) and observe the live-read fallback.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::{Resource, ResourceExt};

use crate::cache::{CacheLookup, LiveSource, LocalIndex, ReadThrough};
use crate::crd::{secret_index_key, Cluster, Token, User, UserAttribute};
use crate::error::{Result, StoreError};
use crate::store::{ClusterStore, TokenStore, UserStore};

#[derive(Default)]
struct Tokens {
    objects: DashMap<String, Token>,
    index: DashMap<String, Token>,
    index_synced: AtomicBool,
    live_reads: AtomicUsize,
}

impl LocalIndex<Token> for Tokens {
    fn get(&self, key: &str) -> CacheLookup<Token> {
        if !self.index_synced.load(Ordering::SeqCst) {
            return CacheLookup::Unavailable;
        }
        match self.index.get(key) {
            Some(token) => CacheLookup::Hit(token.clone()),
            None => CacheLookup::Miss,
        }
    }
}

#[async_trait]
impl LiveSource<Token> for Tokens {
    async fn live_get(&self, key: &str) -> Result<Option<Token>> {
        self.live_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.get(key).map(|t| t.clone()))
    }
}

/// In-memory implementation of every store trait
pub struct MemoryStore {
    tokens: Arc<Tokens>,
    token_cache: ReadThrough<Token>,
    users: DashMap<String, User>,
    attributes: DashMap<String, UserAttribute>,
    clusters: DashMap<String, Cluster>,
    version: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with a synced token index
    pub fn new() -> Self {
        let tokens = Arc::new(Tokens {
            index_synced: AtomicBool::new(true),
            ..Default::default()
        });
        let token_cache = ReadThrough::new("Token", tokens.clone(), tokens.clone());
        Self {
            tokens,
            token_cache,
            users: DashMap::new(),
            attributes: DashMap::new(),
            clusters: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    fn stamp<K: Resource>(&self, obj: &mut K) {
        let rv = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.meta_mut().resource_version = Some(rv.to_string());
    }

    /// Insert or overwrite a token, indexing it by secret
    pub fn insert_token(&self, mut token: Token) {
        self.stamp(&mut token);
        self.unindex(&token.name_any());
        self.tokens.index.insert(token.index_key(), token.clone());
        self.tokens.objects.insert(token.name_any(), token);
    }

    /// Insert a token without updating the index, simulating a lagging cache
    pub fn insert_token_unindexed(&self, mut token: Token) {
        self.stamp(&mut token);
        self.tokens.objects.insert(token.name_any(), token);
    }

    /// Mark the token index synced or not synced
    pub fn set_index_synced(&self, synced: bool) {
        self.tokens.index_synced.store(synced, Ordering::SeqCst);
    }

    /// Number of live token reads served so far
    pub fn token_live_reads(&self) -> usize {
        self.tokens.live_reads.load(Ordering::SeqCst)
    }

    /// Current copy of a token, bypassing the index
    pub fn token(&self, name: &str) -> Option<Token> {
        self.tokens.objects.get(name).map(|t| t.clone())
    }

    /// Insert or overwrite a user
    pub fn insert_user(&self, mut user: User) {
        self.stamp(&mut user);
        self.users.insert(user.name_any(), user);
    }

    /// Insert or overwrite a user attribute record
    pub fn insert_attribute(&self, mut attr: UserAttribute) {
        self.stamp(&mut attr);
        self.attributes.insert(attr.name_any(), attr);
    }

    /// Current copy of a user attribute record
    pub fn attribute(&self, user_id: &str) -> Option<UserAttribute> {
        self.attributes.get(user_id).map(|a| a.clone())
    }

    /// Insert or overwrite a cluster
    pub fn insert_cluster(&self, mut cluster: Cluster) {
        self.stamp(&mut cluster);
        self.clusters.insert(cluster.name_any(), cluster);
    }

    /// Remove a cluster
    pub fn remove_cluster(&self, name: &str) {
        self.clusters.remove(name);
    }

    fn unindex(&self, name: &str) {
        self.tokens
            .index
            .retain(|_, t| t.metadata.name.as_deref() != Some(name));
    }

    fn check_version<K: Resource>(
        kind: &'static str,
        name: &str,
        current: &K,
        incoming: &K,
    ) -> Result<()> {
        match incoming.meta().resource_version.as_deref() {
            Some(rv) if Some(rv) != current.meta().resource_version.as_deref() => {
                Err(StoreError::conflict(kind, name))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn lookup(&self, name: &str, secret: &str) -> Result<Option<Token>> {
        self.token_cache.get(&secret_index_key(secret), name).await
    }

    async fn get(&self, name: &str) -> Result<Option<Token>> {
        self.tokens.live_get(name).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Token>> {
        Ok(self
            .tokens
            .objects
            .iter()
            .filter(|t| t.spec.user_id == user_id)
            .map(|t| t.clone())
            .collect())
    }

    async fn update(&self, mut token: Token) -> Result<Token> {
        let name = token.name_any();
        {
            let current = self
                .tokens
                .objects
                .get(&name)
                .ok_or_else(|| StoreError::not_found("Token", &name))?;
            Self::check_version("Token", &name, &*current, &token)?;
        }
        self.stamp(&mut token);
        self.unindex(&name);
        self.tokens.index.insert(token.index_key(), token.clone());
        self.tokens.objects.insert(name, token.clone());
        Ok(token)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.unindex(name);
        self.tokens
            .objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("Token", name))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.users.iter().map(|u| u.clone()).collect())
    }

    async fn get_attribute(&self, user_id: &str) -> Result<Option<UserAttribute>> {
        Ok(self.attribute(user_id))
    }

    async fn create_attribute(&self, mut attr: UserAttribute) -> Result<UserAttribute> {
        let name = attr.name_any();
        match self.attributes.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::conflict("UserAttribute", name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.stamp(&mut attr);
                slot.insert(attr.clone());
                Ok(attr)
            }
        }
    }

    async fn update_attribute(&self, mut attr: UserAttribute) -> Result<UserAttribute> {
        let name = attr.name_any();
        let mut current = self
            .attributes
            .get_mut(&name)
            .ok_or_else(|| StoreError::not_found("UserAttribute", &name))?;
        Self::check_version("UserAttribute", &name, &*current, &attr)?;
        self.stamp(&mut attr);
        *current = attr.clone();
        Ok(attr)
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters.get(name).map(|c| c.clone()))
    }
}
