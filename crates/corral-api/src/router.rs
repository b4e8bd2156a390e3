//! Cluster proxy cache and router
//!
//! Proxy handles are expensive (TLS config, connection pool, dialer), so
//! one is built per cluster and reused. Concurrent first requests for the
//! same cluster serialize on a per-cluster lock and re-check the cache
//! inside it, so exactly one build runs. The lock is held around the build
//! only, never around proxying.
//!
//! Each entry remembers a fingerprint of the connection details it was
//! built from. A cluster whose endpoint, CA or token changed is rebuilt on
//! its next request.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use corral_common::crd::{secret_index_key, Cluster};
use corral_common::keyed_lock::KeyedLock;
use dashmap::DashMap;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::access::AccessReview;
use crate::error::Result;
use crate::identity::Identity;
use crate::impersonation::DownstreamReviewer;
use crate::lookup::ClusterLookup;

/// Handler bound to one downstream cluster
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    /// Proxy `request` as `identity`
    ///
    /// Failures are written into the response.
    async fn serve(&self, request: Request<Body>, identity: &Identity) -> Response<Body>;

    /// Ask the cluster whether the review's subject is allowed
    async fn review(&self, review: &AccessReview) -> Result<bool>;
}

/// Builds cluster handlers
#[async_trait]
pub trait ProxyFactory: Send + Sync {
    /// Build the handler for `cluster`
    async fn build(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandler>>;
}

/// Connection details a cached handler was built from
#[derive(Clone, Debug, PartialEq, Eq)]
struct Fingerprint {
    endpoint: String,
    ca_cert: String,
    token_digest: String,
}

impl Fingerprint {
    fn of(cluster: &Cluster) -> Self {
        let status = cluster.status.as_ref();
        Self {
            endpoint: status.map(|s| s.api_endpoint.clone()).unwrap_or_default(),
            ca_cert: status.map(|s| s.ca_cert.clone()).unwrap_or_default(),
            token_digest: status
                .map(|s| secret_index_key(&s.service_account_token))
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    fingerprint: Fingerprint,
    handler: Arc<dyn ClusterHandler>,
}

fn lock_key(cluster_id: &str) -> String {
    format!("cluster.{cluster_id}")
}

/// Routes requests to cached per-cluster handlers
pub struct ClusterRouter {
    lookup: ClusterLookup,
    factory: Arc<dyn ProxyFactory>,
    entries: DashMap<String, CacheEntry>,
    locks: KeyedLock,
}

impl ClusterRouter {
    /// Create a router resolving clusters through `lookup`
    pub fn new(lookup: ClusterLookup, factory: Arc<dyn ProxyFactory>) -> Self {
        Self {
            lookup,
            factory,
            entries: DashMap::new(),
            locks: KeyedLock::new(),
        }
    }

    /// Resolve the cluster addressed by `path` and its handler
    ///
    /// The caller must be allowed to view the cluster.
    pub async fn route(
        &self,
        identity: &Identity,
        path: &str,
    ) -> Result<(Cluster, Arc<dyn ClusterHandler>)> {
        let cluster = self.lookup.lookup(identity, path).await?;
        let handler = self.handler_for(&cluster).await?;
        Ok((cluster, handler))
    }

    /// Cached handler for `cluster`, building it on first use
    pub async fn handler_for(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandler>> {
        let cluster_id = cluster.name_any();
        let fingerprint = Fingerprint::of(cluster);

        if let Some(handler) = self.cached(&cluster_id, &fingerprint) {
            return Ok(handler);
        }

        let _guard = self.locks.lock(&lock_key(&cluster_id)).await;

        // Another request may have built it while we waited
        if let Some(handler) = self.cached(&cluster_id, &fingerprint) {
            return Ok(handler);
        }

        let rebuild = self.entries.contains_key(&cluster_id);
        let handler = self.factory.build(cluster).await.map_err(|e| {
            warn!(cluster = %cluster_id, error = %e, "Failed to build cluster proxy");
            e
        })?;
        self.entries.insert(
            cluster_id.clone(),
            CacheEntry {
                fingerprint,
                handler: handler.clone(),
            },
        );

        if rebuild {
            info!(cluster = %cluster_id, "Rebuilt cluster proxy after connection change");
        } else {
            info!(cluster = %cluster_id, "Built cluster proxy");
        }
        Ok(handler)
    }

    fn cached(&self, cluster_id: &str, fingerprint: &Fingerprint) -> Option<Arc<dyn ClusterHandler>> {
        self.entries
            .get(cluster_id)
            .filter(|entry| entry.fingerprint == *fingerprint)
            .map(|entry| entry.handler.clone())
    }

    /// Drop the cached handler for `cluster_id`
    pub fn invalidate(&self, cluster_id: &str) {
        if self.entries.remove(cluster_id).is_some() {
            debug!(cluster = %cluster_id, "Invalidated cluster proxy");
        }
        self.locks.remove(&lock_key(cluster_id));
    }

    /// Drop every cached handler
    pub fn clear(&self) {
        self.entries.clear();
        self.locks.retain_held();
    }

    /// Number of cached handlers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handler is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DownstreamReviewer for ClusterRouter {
    async fn review_on_cluster(&self, cluster_id: &str, review: &AccessReview) -> Result<bool> {
        let cluster = self.lookup.resolve(cluster_id).await?;
        let handler = self.handler_for(&cluster).await?;
        handler.review(review).await
    }
}
