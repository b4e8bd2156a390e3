//! Path utilities for the cluster proxy
//!
//! Cluster-addressed requests use `/k8s/clusters/<id>/<kubernetes API path>`.

/// Prefix of every cluster-addressed path
pub const CLUSTER_PATH_PREFIX: &str = "/k8s/clusters/";

/// Extract the cluster ID from a `/k8s/clusters/<id>/...` path
///
/// # Examples
///
/// ```
/// use corral_api::routing::cluster_from_path;
///
/// assert_eq!(
///     cluster_from_path("/k8s/clusters/c-955nj/api/v1/pods"),
///     Some("c-955nj")
/// );
/// assert_eq!(cluster_from_path("/v3/users"), None);
/// ```
pub fn cluster_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(CLUSTER_PATH_PREFIX)?;
    let cluster = rest.split('/').next()?;
    if cluster.is_empty() {
        None
    } else {
        Some(cluster)
    }
}

/// Strip the `/k8s/clusters/<id>` prefix to get the Kubernetes API path
///
/// Returns `/` when nothing follows the prefix. Paths that do not carry the
/// prefix are returned unchanged.
///
/// # Examples
///
/// ```
/// use corral_api::routing::strip_cluster_prefix;
///
/// assert_eq!(
///     strip_cluster_prefix("/k8s/clusters/c-1/api/v1/pods", "c-1"),
///     "/api/v1/pods"
/// );
/// ```
pub fn strip_cluster_prefix<'a>(full_path: &'a str, cluster_id: &str) -> &'a str {
    let rest = full_path
        .strip_prefix(CLUSTER_PATH_PREFIX)
        .and_then(|p| p.strip_prefix(cluster_id));
    match rest {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => full_path,
    }
}
