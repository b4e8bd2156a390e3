//! HTTP server wiring
//!
//! Every cluster request runs the same stack:
//! `sanitize → authenticate → impersonate → route`. The health check sits
//! outside it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Extension, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use corral_common::crd::API_GROUP;
use corral_refresh::RefreshHandle;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::access::{AccessReview, AccessReviewer};
use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::impersonation::{impersonation_middleware, Impersonator};
use crate::router::ClusterRouter;
use crate::sanitize::sanitize_middleware;

/// How long in-flight requests get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// TLS certificate and key PEM files; plain HTTP when absent
    pub tls: Option<TlsFiles>,
}

/// Certificate and key served by the listener
#[derive(Clone, Debug)]
pub struct TlsFiles {
    /// Certificate chain PEM
    pub cert_path: PathBuf,
    /// Private key PEM
    pub key_path: PathBuf,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Authenticator chain
    pub auth: Arc<dyn Authenticator>,
    /// Impersonation authorizer
    pub impersonator: Arc<Impersonator>,
    /// Cluster lookup and proxy cache
    pub router: Arc<ClusterRouter>,
    /// Access reviews for local resources
    pub reviewer: Arc<dyn AccessReviewer>,
    /// Refresh daemon handle
    pub refresh: RefreshHandle,
}

/// Build the application router
pub fn app(state: AppState) -> Router {
    // Layers run bottom-up: sanitize first, impersonation last.
    let pipeline = Router::new()
        .route("/v3/users/refresh", post(refresh_handler))
        .route("/k8s/clusters/{*rest}", any(proxy_handler))
        .route_layer(middleware::from_fn_with_state(
            state.impersonator.clone(),
            impersonation_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            authenticate_middleware,
        ))
        .route_layer(middleware::from_fn(sanitize_middleware))
        .with_state(state);

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(pipeline)
}

/// Middleware attaching the authenticated [`Identity`] to the request
pub async fn authenticate_middleware(
    State(auth): State<Arc<dyn Authenticator>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match auth
        .authenticate(request.headers(), request.uri().path())
        .await
    {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            debug!(path = %request.uri().path(), error = %e, "Authentication failed");
            e.into_response()
        }
    }
}

/// Proxy a cluster request to its downstream cluster
#[instrument(skip(state, identity, request), fields(user = %identity.name, path = %request.uri().path()))]
async fn proxy_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request: Request<Body>,
) -> Response {
    match state.router.route(&identity, request.uri().path()).await {
        Ok((_, handler)) => handler.serve(request, &identity).await,
        Err(e) => {
            debug!(error = %e, "Cluster routing failed");
            e.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshQuery {
    user: Option<String>,
}

/// Force a refresh of one user (`?user=<id>`) or of every user
async fn refresh_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<serde_json::Value>> {
    let target = query.user.as_deref().unwrap_or_default();
    let review = AccessReview::new(&identity, "refresh", API_GROUP, "users", target);
    if !state.reviewer.review(&review).await? {
        return Err(Error::Forbidden(format!(
            "user {} cannot refresh users",
            identity.name
        )));
    }

    match query.user {
        Some(user_id) => {
            info!(user = %user_id, by = %identity.name, "Refreshing user on request");
            let report = state.refresh.refresh_user(&user_id).await?;
            Ok(Json(serde_json::json!({
                "user": report.user_id,
                "hasAccess": report.has_access,
                "providerErrors": report.provider_errors,
                "revokedLoginTokens": report.revoked_login_tokens,
                "disabledDerivedTokens": report.disabled_derived_tokens,
            })))
        }
        None => {
            info!(by = %identity.name, "Refreshing all users on request");
            let refreshed = state.refresh.refresh_all().await?;
            Ok(Json(serde_json::json!({ "refreshed": refreshed })))
        }
    }
}

/// Serve until `cancel` fires, then drain in-flight requests
pub async fn serve(config: ServerConfig, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = app(state);

    let handle = Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        info!("Shutting down listener");
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let served = match config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|e| Error::Internal(format!("TLS config error: {e}")))?;
            info!(addr = %config.addr, "Starting corral server with TLS");
            axum_server::bind_rustls(config.addr, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(addr = %config.addr, "Starting corral server without TLS");
            axum_server::bind(config.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    served.map_err(|e| Error::Internal(format!("server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MockAccessReviewer;
    use crate::auth::MockAuthenticator;
    use crate::lookup::ClusterLookup;
    use crate::router::{ClusterHandler, ProxyFactory};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use corral_common::crd::{Cluster, User, UserSpec};
    use corral_common::memory::MemoryStore;
    use corral_refresh::{RefreshConfig, RefreshDaemon, Refresher};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoClusters;

    #[async_trait]
    impl ProxyFactory for NoClusters {
        async fn build(&self, _cluster: &Cluster) -> Result<Arc<dyn ClusterHandler>> {
            Err(Error::UpstreamFailure("no clusters in this test".into()))
        }
    }

    fn state(allow_refresh: bool) -> (AppState, CancellationToken) {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new("u-1", UserSpec::default()));

        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate().returning(|headers, _| {
            if headers.contains_key("authorization") {
                Ok(Identity::user("admin"))
            } else {
                Err(Error::Unauthenticated("must authenticate".into()))
            }
        });

        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_review()
            .withf(|r| r.verb == "refresh" && r.resource == "users")
            .returning(move |_| Ok(allow_refresh));
        let reviewer: Arc<dyn AccessReviewer> = Arc::new(reviewer);

        let refresher = Refresher::new(
            store.clone(),
            store.clone(),
            Vec::new(),
            Duration::from_secs(3600),
        );
        let daemon = RefreshDaemon::new(
            refresher,
            RefreshConfig {
                sweep_interval: None,
                ..Default::default()
            },
        );
        let refresh = daemon.handle();
        let cancel = CancellationToken::new();
        daemon.spawn(cancel.clone());

        let lookup = ClusterLookup::new(store.clone(), reviewer.clone());
        let state = AppState {
            auth: Arc::new(auth),
            impersonator: Arc::new(Impersonator::new(reviewer.clone(), store.clone())),
            router: Arc::new(ClusterRouter::new(lookup, Arc::new(NoClusters))),
            reviewer,
            refresh,
        };
        (state, cancel)
    }

    fn request(method: &str, uri: &str, authenticated: bool) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if authenticated {
            builder = builder.header("authorization", "Bearer t-1:secret");
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_skips_authentication() {
        let (state, cancel) = state(true);
        let response = app(state)
            .oneshot(request("GET", "/healthz", false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cluster_route_requires_authentication() {
        let (state, cancel) = state(true);
        let response = app(state)
            .oneshot(request("GET", "/k8s/clusters/c-1/api", false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refresh_user() {
        let (state, cancel) = state(true);
        let response = app(state)
            .oneshot(request("POST", "/v3/users/refresh?user=u-1", true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["user"], "u-1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refresh_unknown_user_is_not_found() {
        let (state, cancel) = state(true);
        let response = app(state)
            .oneshot(request("POST", "/v3/users/refresh?user=u-x", true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refresh_all_requires_permission() {
        let (state, cancel) = state(false);
        let response = app(state)
            .oneshot(request("POST", "/v3/users/refresh", true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refresh_all() {
        let (state, cancel) = state(true);
        let response = app(state)
            .oneshot(request("POST", "/v3/users/refresh", true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["refreshed"], 1);
        cancel.cancel();
    }
}
