//! Cluster lookup
//!
//! Resolves the cluster a request addresses and checks the caller may view
//! it before anything is proxied.

use std::sync::Arc;

use corral_common::crd::{Cluster, API_GROUP};
use corral_common::store::ClusterStore;
use tracing::debug;

use crate::access::{AccessReview, AccessReviewer};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::routing::cluster_from_path;

/// Resolves `/k8s/clusters/<id>` paths to clusters the caller can view
pub struct ClusterLookup {
    clusters: Arc<dyn ClusterStore>,
    reviewer: Arc<dyn AccessReviewer>,
}

impl ClusterLookup {
    /// Create a lookup over `clusters`, authorizing with `reviewer`
    pub fn new(clusters: Arc<dyn ClusterStore>, reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { clusters, reviewer }
    }

    /// Resolve the cluster addressed by `path` on behalf of `identity`
    pub async fn lookup(&self, identity: &Identity, path: &str) -> Result<Cluster> {
        let cluster_id = cluster_from_path(path)
            .ok_or_else(|| Error::NotFound("no cluster in request path".into()))?;

        let review = AccessReview::new(identity, "get", API_GROUP, "clusters", cluster_id);
        if !self.reviewer.review(&review).await? {
            debug!(user = %identity.name, cluster = %cluster_id, "Cluster access denied");
            return Err(Error::Forbidden(format!(
                "user {} cannot get cluster {}",
                identity.name, cluster_id
            )));
        }

        self.resolve(cluster_id).await
    }

    /// Read a cluster by ID without an access check
    pub async fn resolve(&self, cluster_id: &str) -> Result<Cluster> {
        self.clusters
            .get(cluster_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cluster {cluster_id} not found")))
    }
}
