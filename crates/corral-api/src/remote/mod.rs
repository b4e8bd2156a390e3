//! Remote service: the reverse proxy bound to one downstream cluster
//!
//! A [`RemoteService`] owns the outbound transport for its cluster. It is
//! built once by [`RemoteProxyFactory`] and cached by the
//! [`ClusterRouter`](crate::router::ClusterRouter) until the cluster's
//! connection details change.
//!
//! Requests are forwarded with the cluster path prefix stripped, inbound
//! credentials removed and the caller asserted downstream either through
//! impersonation headers on the cluster's service-account token or through
//! a freshly minted token.

mod connector;
mod dialer;
mod tls;
mod upgrade;

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use corral_common::crd::Cluster;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use k8s_openapi::api::authorization::v1::SubjectAccessReview;
use kube::ResourceExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

pub use connector::{DialConnector, DialedStream, MaybeTls, TlsSettings};
pub use dialer::{
    BoxedIo, DefaultDialerFactory, Dialer, DialerFactory, DirectDialer, Io, TunnelDialer,
    TunnelRegistry,
};
pub use tls::{client_config, decode_ca, root_store, server_name};
pub use upgrade::{is_upgrade_request, spawn_bridge};

use crate::access::AccessReview;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::router::{ClusterHandler, ProxyFactory};
use crate::routing::strip_cluster_prefix;

const SUBJECT_ACCESS_REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/subjectaccessreviews";

/// Characters escaped in `Impersonate-Extra-<key>` header names
const EXTRA_KEY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Hop-by-hop headers never forwarded as-is
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Mints short-lived downstream tokens for a caller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// Token authenticating `identity` on cluster `cluster_id`
    async fn mint(&self, cluster_id: &str, identity: &Identity) -> Result<Zeroizing<String>>;
}

/// How the caller is asserted downstream
#[derive(Clone)]
pub enum OutboundAuth {
    /// Cluster service-account token plus `Impersonate-*` headers
    ServiceAccount,
    /// A token minted per request
    Minted(Arc<dyn TokenMinter>),
}

/// Proxy settings shared by every cluster
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// `X-Forwarded-Proto` sent when the inbound request carries none
    pub forwarded_proto: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            forwarded_proto: "https".to_string(),
        }
    }
}

/// Reverse proxy bound to one cluster
pub struct RemoteService {
    cluster_id: String,
    target: Uri,
    client: Client<DialConnector, Body>,
    service_account_token: Option<Zeroizing<String>>,
    auth: OutboundAuth,
    config: ProxyConfig,
}

fn upstream_err(e: impl StdError) -> Error {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    Error::UpstreamFailure(message)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::UpstreamFailure("identity contains an invalid header value".into()))
}

/// Parse a cluster endpoint, defaulting to `https` when no scheme is given
fn parse_endpoint(endpoint: &str) -> Result<Uri> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    };
    let uri: Uri = with_scheme
        .parse()
        .map_err(|e| Error::UpstreamFailure(format!("invalid API endpoint {endpoint}: {e}")))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(Error::UpstreamFailure(format!(
                "unsupported API endpoint scheme in {endpoint}"
            )))
        }
    }
    if uri.host().is_none() {
        return Err(Error::UpstreamFailure(format!(
            "API endpoint {endpoint} has no host"
        )));
    }
    Ok(uri)
}

impl RemoteService {
    /// Build the proxy for `cluster`
    ///
    /// Fails when the endpoint is malformed, when an `https` endpoint has no
    /// CA, when the CA does not parse, or when service-account auth is
    /// requested for a cluster without a token.
    pub fn build(
        cluster: &Cluster,
        dialer: Arc<dyn Dialer>,
        auth: OutboundAuth,
        config: ProxyConfig,
    ) -> Result<Self> {
        let cluster_id = cluster.name_any();
        let status = cluster.status.clone().unwrap_or_default();

        if status.api_endpoint.trim().is_empty() {
            return Err(Error::UpstreamFailure(format!(
                "cluster {cluster_id} has no API endpoint"
            )));
        }
        let target = parse_endpoint(&status.api_endpoint)?;

        let tls = if target.scheme_str() == Some("https") {
            if status.ca_cert.trim().is_empty() {
                return Err(Error::UpstreamFailure(format!(
                    "cluster {cluster_id} has an https endpoint but no CA certificate"
                )));
            }
            let host = target.host().unwrap_or_default();
            Some(TlsSettings {
                config: client_config(&status.ca_cert)?,
                server_name: server_name(host)?,
            })
        } else {
            None
        };

        let service_account_token = Some(status.service_account_token)
            .filter(|t| !t.is_empty())
            .map(Zeroizing::new);
        if matches!(auth, OutboundAuth::ServiceAccount) && service_account_token.is_none() {
            return Err(Error::UpstreamFailure(format!(
                "cluster {cluster_id} has no service account token"
            )));
        }

        let connector = DialConnector::new(dialer, tls);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        debug!(cluster = %cluster_id, target = %target, "Built remote service");
        Ok(Self {
            cluster_id,
            target,
            client,
            service_account_token,
            auth,
            config,
        })
    }

    /// Cluster this service proxies to
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Downstream endpoint
    pub fn target(&self) -> &Uri {
        &self.target
    }

    fn target_uri(&self, path_and_query: &str) -> Result<Uri> {
        let base = self.target.path().trim_end_matches('/');
        let authority = self
            .target
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();
        let scheme = self.target.scheme_str().unwrap_or("https");
        format!("{scheme}://{authority}{base}{path_and_query}")
            .parse()
            .map_err(|e| Error::UpstreamFailure(format!("invalid target URL: {e}")))
    }

    fn service_account_bearer(&self) -> Result<HeaderValue> {
        let token = self.service_account_token.as_ref().ok_or_else(|| {
            Error::UpstreamFailure(format!(
                "cluster {} has no service account token",
                self.cluster_id
            ))
        })?;
        let mut value = header_value(&format!("Bearer {}", token.as_str()))?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Headers asserting the caller downstream
    async fn outbound_auth(&self, identity: &Identity, headers: &mut HeaderMap) -> Result<()> {
        match &self.auth {
            OutboundAuth::Minted(minter) => {
                let token = minter.mint(&self.cluster_id, identity).await?;
                let mut value = header_value(&format!("Bearer {}", token.as_str()))?;
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
            OutboundAuth::ServiceAccount => {
                headers.insert(header::AUTHORIZATION, self.service_account_bearer()?);
                headers.insert("impersonate-user", header_value(&identity.name)?);
                if !identity.uid.is_empty() {
                    headers.insert("impersonate-uid", header_value(&identity.uid)?);
                }
                for group in &identity.groups {
                    headers.append("impersonate-group", header_value(group)?);
                }
                for (key, values) in &identity.extra {
                    let name = format!("impersonate-extra-{}", utf8_percent_encode(key, EXTRA_KEY));
                    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                        Error::UpstreamFailure(format!("invalid extra key {key}"))
                    })?;
                    for value in values {
                        headers.append(name.clone(), header_value(value)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Inbound headers minus credentials, impersonation and hop-by-hop
    fn forwarded_headers(&self, inbound: &HeaderMap, upgrade: bool) -> HeaderMap {
        let listed: Vec<HeaderName> = inbound
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
            .collect();

        let mut headers = inbound.clone();
        for name in HOP_BY_HOP {
            headers.remove(name);
        }
        for name in listed.iter().filter(|n| !(upgrade && **n == header::UPGRADE)) {
            headers.remove(name);
        }
        if !upgrade {
            headers.remove(header::UPGRADE);
        } else {
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        }
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::COOKIE);
        let impersonation: Vec<HeaderName> = headers
            .keys()
            .filter(|n| n.as_str().starts_with("impersonate-"))
            .cloned()
            .collect();
        for name in impersonation {
            headers.remove(name);
        }

        if !headers.contains_key("x-forwarded-proto") {
            if let Ok(proto) = HeaderValue::from_str(&self.config.forwarded_proto) {
                headers.insert("x-forwarded-proto", proto);
            }
        }
        if let Some(host) = inbound.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        headers
    }

    /// Forward `request` as `identity`
    #[instrument(skip(self, request, identity), fields(cluster = %self.cluster_id, user = %identity.name))]
    pub async fn forward(
        &self,
        mut request: Request<Body>,
        identity: &Identity,
    ) -> Result<Response<Body>> {
        let upgrade = is_upgrade_request(request.headers());
        let inbound_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let path = strip_cluster_prefix(request.uri().path(), &self.cluster_id).to_string();
        let path_and_query = match request.uri().query() {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        let uri = self.target_uri(&path_and_query)?;

        let (parts, body) = request.into_parts();
        let mut headers = self.forwarded_headers(&parts.headers, upgrade);
        self.outbound_auth(identity, &mut headers).await?;

        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(http::Version::HTTP_11)
            .body(body)
            .map_err(|e| Error::UpstreamFailure(e.to_string()))?;
        *outbound.headers_mut() = headers;

        debug!(method = %outbound.method(), path = %path_and_query, upgrade, "Proxying request");
        let mut response = self.client.request(outbound).await.map_err(upstream_err)?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(inbound_upgrade) = inbound_upgrade else {
                return Err(Error::UpstreamFailure(
                    "cluster switched protocols on a plain request".into(),
                ));
            };
            let outbound_upgrade = hyper::upgrade::on(&mut response);
            spawn_bridge(self.cluster_id.clone(), inbound_upgrade, outbound_upgrade);
            let (parts, _) = response.into_parts();
            return Ok(Response::from_parts(parts, Body::empty()));
        }

        Ok(response.map(Body::new))
    }

    /// Ask this cluster whether the review's subject is allowed
    ///
    /// Sent as the cluster's service account, without impersonation.
    pub async fn review(&self, review: &AccessReview) -> Result<bool> {
        let body = serde_json::to_vec(&review.to_subject_access_review())
            .map_err(|e| Error::Internal(e.to_string()))?;

        let request = Request::builder()
            .method(http::Method::POST)
            .uri(self.target_uri(SUBJECT_ACCESS_REVIEW_PATH)?)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .header(header::AUTHORIZATION, self.service_account_bearer()?)
            .body(Body::from(body))
            .map_err(|e| Error::UpstreamFailure(e.to_string()))?;

        let response = self.client.request(request).await.map_err(upstream_err)?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(upstream_err)?
            .to_bytes();
        if !status.is_success() {
            return Err(Error::UpstreamFailure(format!(
                "SubjectAccessReview on cluster {} returned {}",
                self.cluster_id, status
            )));
        }

        let result: SubjectAccessReview = serde_json::from_slice(&bytes).map_err(|e| {
            Error::UpstreamFailure(format!("invalid SubjectAccessReview response: {e}"))
        })?;
        Ok(result.status.map(|s| s.allowed).unwrap_or(false))
    }
}

#[async_trait]
impl ClusterHandler for RemoteService {
    async fn serve(&self, request: Request<Body>, identity: &Identity) -> Response<Body> {
        match self.forward(request, identity).await {
            Ok(response) => response,
            Err(e) => {
                debug!(cluster = %self.cluster_id, error = %e, "Proxy request failed");
                e.into_response()
            }
        }
    }

    async fn review(&self, review: &AccessReview) -> Result<bool> {
        RemoteService::review(self, review).await
    }
}

/// Builds [`RemoteService`]s for the router
pub struct RemoteProxyFactory {
    dialers: Arc<dyn DialerFactory>,
    minter: Option<Arc<dyn TokenMinter>>,
    config: ProxyConfig,
}

impl RemoteProxyFactory {
    /// Factory dialing through `dialers`, asserting callers by impersonation
    pub fn new(dialers: Arc<dyn DialerFactory>, config: ProxyConfig) -> Self {
        Self {
            dialers,
            minter: None,
            config,
        }
    }

    /// Mint a token per request instead of impersonating
    pub fn with_minter(mut self, minter: Arc<dyn TokenMinter>) -> Self {
        self.minter = Some(minter);
        self
    }
}

#[async_trait]
impl ProxyFactory for RemoteProxyFactory {
    async fn build(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandler>> {
        let auth = match &self.minter {
            Some(minter) => OutboundAuth::Minted(minter.clone()),
            None => OutboundAuth::ServiceAccount,
        };
        let dialer = self.dialers.dialer_for(&cluster.name_any());
        let service = RemoteService::build(cluster, dialer, auth, self.config.clone())?;
        Ok(Arc::new(service))
    }
}
