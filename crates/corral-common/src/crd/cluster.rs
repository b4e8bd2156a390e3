//! Cluster CRD - a downstream Kubernetes cluster
//!
//! Only the status fields the proxy needs to reach the cluster's API server
//! are modelled here. The cluster lifecycle controller owns this resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster is a downstream cluster reachable through the proxy.
///
/// Example:
/// ```yaml
/// apiVersion: management.corral.dev/v3
/// kind: Cluster
/// metadata:
///   name: c-955nj
/// spec:
///   displayName: edge-east
/// status:
///   apiEndpoint: https://10.0.0.12:6443
///   caCert: LS0tLS1CRUdJTi...
///   serviceAccountToken: eyJhbGciOi...
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.corral.dev",
    version = "v3",
    kind = "Cluster",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiEndpoint"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Human readable name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

/// Connection details published by the cluster lifecycle controller
#[derive(Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// API server URL
    #[serde(default)]
    pub api_endpoint: String,

    /// Base64 encoded PEM bundle of the API server's CA
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,

    /// Token of the service account the proxy authenticates as
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_token: String,
}

impl std::fmt::Debug for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStatus")
            .field("api_endpoint", &self.api_endpoint)
            .field("has_ca_cert", &!self.ca_cert.is_empty())
            .field("service_account_token", &"[REDACTED]")
            .finish()
    }
}
