//! Kubernetes-backed stores
//!
//! Each store pairs a watcher-fed [`WatchedIndex`] with live reads through
//! the API server. Writes use `Api::replace`, which carries the object's
//! `resourceVersion`, so a concurrent writer surfaces as `Conflict`.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, LiveSource, LocalIndex, ReadThrough};
use crate::crd::{secret_index_key, Cluster, Token, User, UserAttribute};
use crate::error::{Result, StoreError};
use crate::store::{ClusterStore, TokenStore, UserStore};

/// Capacity of the deletion broadcast channel
const DELETION_CHANNEL_CAPACITY: usize = 256;

type KeyFn<K> = Arc<dyn Fn(&K) -> Option<String> + Send + Sync>;

fn store_err<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(kube::Error) -> StoreError + 'a {
    move |err| match StoreError::from(err) {
        StoreError::NotFound { .. } => StoreError::not_found(kind, name),
        StoreError::Conflict { .. } => StoreError::conflict(kind, name),
        other => other,
    }
}

/// Local index fed by a Kubernetes watcher
///
/// Objects are keyed by an arbitrary key function. The index answers
/// `Unavailable` until the watcher's initial list completes and after
/// it has been stopped.
pub struct WatchedIndex<K> {
    kind: &'static str,
    key_fn: KeyFn<K>,
    objects: DashMap<String, K>,
    keys_by_name: DashMap<String, String>,
    synced: AtomicBool,
    deletions: broadcast::Sender<String>,
}

impl<K> WatchedIndex<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Create an index for `kind`, keyed by `key_fn`
    pub fn new(
        kind: &'static str,
        key_fn: impl Fn(&K) -> Option<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (deletions, _) = broadcast::channel(DELETION_CHANNEL_CAPACITY);
        Arc::new(Self {
            kind,
            key_fn: Arc::new(key_fn),
            objects: DashMap::new(),
            keys_by_name: DashMap::new(),
            synced: AtomicBool::new(false),
            deletions,
        })
    }

    /// Create an index keyed by object name
    pub fn by_name(kind: &'static str) -> Arc<Self> {
        Self::new(kind, |obj: &K| obj.meta().name.clone())
    }

    /// Whether the initial list has completed
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Every indexed object matching `pred`, or `None` before the initial sync
    pub fn select(&self, pred: impl Fn(&K) -> bool) -> Option<Vec<K>> {
        if !self.is_synced() {
            return None;
        }
        Some(
            self.objects
                .iter()
                .filter(|entry| pred(entry.value()))
                .map(|entry| entry.value().clone())
                .collect(),
        )
    }

    /// Subscribe to the names of deleted objects
    pub fn deletions(&self) -> broadcast::Receiver<String> {
        self.deletions.subscribe()
    }

    fn apply(&self, obj: K) {
        let name = obj.name_any();
        let Some(key) = (self.key_fn)(&obj) else {
            self.remove_by_name(&name);
            return;
        };
        if let Some(old_key) = self.keys_by_name.insert(name, key.clone()) {
            if old_key != key {
                self.objects.remove(&old_key);
            }
        }
        self.objects.insert(key, obj);
    }

    fn remove_by_name(&self, name: &str) {
        if let Some((_, key)) = self.keys_by_name.remove(name) {
            self.objects.remove(&key);
        }
    }

    fn replace_all(&self, objects: Vec<K>) {
        self.objects.clear();
        self.keys_by_name.clear();
        for obj in objects {
            self.apply(obj);
        }
    }

    /// Watch `api` and keep the index current until `cancel` fires
    pub async fn run(self: Arc<Self>, api: Api<K>, cancel: CancellationToken) {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        let mut relist: Vec<K> = Vec::new();

        info!(kind = self.kind, "Starting index watcher");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(Event::Apply(obj))) => self.apply(obj),
                    Some(Ok(Event::Delete(obj))) => {
                        let name = obj.name_any();
                        self.remove_by_name(&name);
                        // No subscribers is fine.
                        let _ = self.deletions.send(name);
                    }
                    Some(Ok(Event::Init)) => relist.clear(),
                    Some(Ok(Event::InitApply(obj))) => relist.push(obj),
                    Some(Ok(Event::InitDone)) => {
                        self.replace_all(std::mem::take(&mut relist));
                        if !self.synced.swap(true, Ordering::SeqCst) {
                            info!(kind = self.kind, objects = self.objects.len(), "Index synced");
                        }
                    }
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watcher error, will retry"),
                    None => break,
                },
            }
        }
        self.synced.store(false, Ordering::SeqCst);
        info!(kind = self.kind, "Index watcher stopped");
    }
}

impl<K: Clone + Send + Sync> LocalIndex<K> for WatchedIndex<K> {
    fn get(&self, key: &str) -> CacheLookup<K> {
        if !self.synced.load(Ordering::SeqCst) {
            return CacheLookup::Unavailable;
        }
        match self.objects.get(key) {
            Some(obj) => CacheLookup::Hit(obj.clone()),
            None => CacheLookup::Miss,
        }
    }
}

/// Live point reads through the API server
pub struct KubeLive<K> {
    kind: &'static str,
    api: Api<K>,
}

impl<K> KubeLive<K> {
    /// Live source for `kind` backed by `api`
    pub fn new(kind: &'static str, api: Api<K>) -> Arc<Self> {
        Arc::new(Self { kind, api })
    }
}

#[async_trait]
impl<K> LiveSource<K> for KubeLive<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn live_get(&self, key: &str) -> Result<Option<K>> {
        debug!(kind = self.kind, name = %key, "Live read");
        self.api.get_opt(key).await.map_err(store_err(self.kind, key))
    }
}

/// Token store over the `Token` resource
pub struct KubeTokenStore {
    api: Api<Token>,
    index: Arc<WatchedIndex<Token>>,
    cache: ReadThrough<Token>,
}

impl KubeTokenStore {
    /// Create a store using `index` for secret lookups
    pub fn new(client: Client, index: Arc<WatchedIndex<Token>>) -> Self {
        let api: Api<Token> = Api::all(client);
        let live = KubeLive::new("Token", api.clone());
        Self {
            cache: ReadThrough::new("Token", index.clone(), live),
            index,
            api,
        }
    }
}

#[async_trait]
impl TokenStore for KubeTokenStore {
    async fn lookup(&self, name: &str, secret: &str) -> Result<Option<Token>> {
        self.cache.get(&secret_index_key(secret), name).await
    }

    async fn get(&self, name: &str) -> Result<Option<Token>> {
        self.api.get_opt(name).await.map_err(store_err("Token", name))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Token>> {
        if let Some(tokens) = self.index.select(|t| t.spec.user_id == user_id) {
            return Ok(tokens);
        }

        debug!(user = %user_id, "Token index unsynced, listing tokens live");
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(store_err("Token", user_id))?;
        Ok(list
            .items
            .into_iter()
            .filter(|t| t.spec.user_id == user_id)
            .collect())
    }

    async fn update(&self, token: Token) -> Result<Token> {
        let name = token.name_any();
        self.api
            .replace(&name, &PostParams::default(), &token)
            .await
            .map_err(store_err("Token", &name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(store_err("Token", name))
    }
}

/// User and UserAttribute store
pub struct KubeUserStore {
    users: Api<User>,
    attributes: Api<UserAttribute>,
}

impl KubeUserStore {
    /// Create a store over cluster-scoped users and attributes
    pub fn new(client: Client) -> Self {
        Self {
            users: Api::all(client.clone()),
            attributes: Api::all(client),
        }
    }
}

#[async_trait]
impl UserStore for KubeUserStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        self.users
            .get_opt(user_id)
            .await
            .map_err(store_err("User", user_id))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let list = self
            .users
            .list(&ListParams::default())
            .await
            .map_err(store_err("User", ""))?;
        Ok(list.items)
    }

    async fn get_attribute(&self, user_id: &str) -> Result<Option<UserAttribute>> {
        self.attributes
            .get_opt(user_id)
            .await
            .map_err(store_err("UserAttribute", user_id))
    }

    async fn create_attribute(&self, attr: UserAttribute) -> Result<UserAttribute> {
        let name = attr.name_any();
        self.attributes
            .create(&PostParams::default(), &attr)
            .await
            .map_err(store_err("UserAttribute", &name))
    }

    async fn update_attribute(&self, attr: UserAttribute) -> Result<UserAttribute> {
        let name = attr.name_any();
        self.attributes
            .replace(&name, &PostParams::default(), &attr)
            .await
            .map_err(store_err("UserAttribute", &name))
    }
}

/// Cluster store reading through a watched index
pub struct KubeClusterStore {
    cache: ReadThrough<Cluster>,
}

impl KubeClusterStore {
    /// Create a store using `index` for name lookups
    pub fn new(client: Client, index: Arc<WatchedIndex<Cluster>>) -> Self {
        let live = KubeLive::new("Cluster", Api::<Cluster>::all(client));
        Self {
            cache: ReadThrough::new("Cluster", index, live),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        self.cache.get(name, name).await
    }
}

/// Kubernetes-backed stores and the watchers feeding their indexes
pub struct KubeStores {
    /// Token store
    pub tokens: Arc<KubeTokenStore>,
    /// User store
    pub users: Arc<KubeUserStore>,
    /// Cluster store
    pub clusters: Arc<KubeClusterStore>,
    /// Cluster index, exposed for deletion notifications
    pub cluster_index: Arc<WatchedIndex<Cluster>>,
    /// Watcher tasks
    pub watchers: Vec<JoinHandle<()>>,
}

impl KubeStores {
    /// Build every store and spawn the index watchers
    pub fn start(client: Client, cancel: CancellationToken) -> Self {
        let token_index =
            WatchedIndex::<Token>::new("Token", |t: &Token| Some(secret_index_key(&t.spec.secret)));
        let cluster_index = WatchedIndex::<Cluster>::by_name("Cluster");

        let watchers = vec![
            tokio::spawn(
                token_index
                    .clone()
                    .run(Api::all(client.clone()), cancel.clone()),
            ),
            tokio::spawn(
                cluster_index
                    .clone()
                    .run(Api::all(client.clone()), cancel),
            ),
        ];

        Self {
            tokens: Arc::new(KubeTokenStore::new(client.clone(), token_index)),
            users: Arc::new(KubeUserStore::new(client.clone())),
            clusters: Arc::new(KubeClusterStore::new(client, cluster_index.clone())),
            cluster_index,
            watchers,
        }
    }
}
