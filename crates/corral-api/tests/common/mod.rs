//! Shared harness for pipeline integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use chrono::Utc;
use corral_api::access::{AccessReview, AccessReviewer};
use corral_api::{
    app, AppState, AuthenticatorConfig, ClusterHandler, ClusterLookup, ClusterRouter, Identity,
    Impersonator, ProxyFactory, Result, TokenAuthenticator,
};
use corral_common::crd::{Cluster, ClusterSpec, ClusterStatus, Token, TokenSpec, User, UserSpec};
use corral_common::memory::MemoryStore;
use corral_refresh::{RefreshConfig, RefreshDaemon, Refresher};
use http_body_util::BodyExt;

type Policy = Box<dyn Fn(&AccessReview) -> bool + Send + Sync>;

/// Reviewer answering from a closure and recording every question
pub struct PolicyReviewer {
    policy: Policy,
    pub reviews: Mutex<Vec<AccessReview>>,
}

impl PolicyReviewer {
    pub fn new(policy: impl Fn(&AccessReview) -> bool + Send + Sync + 'static) -> Self {
        Self {
            policy: Box::new(policy),
            reviews: Mutex::new(Vec::new()),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(|_| true)
    }

    pub fn reviews_for(&self, resource: &str) -> Vec<AccessReview> {
        self.reviews
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.resource == resource)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AccessReviewer for PolicyReviewer {
    async fn review(&self, review: &AccessReview) -> Result<bool> {
        self.reviews.lock().unwrap().push(review.clone());
        Ok((self.policy)(review))
    }
}

/// Downstream stand-in recording the identity each request arrived as
#[derive(Default)]
pub struct RecordingHandler {
    pub served: Mutex<Vec<(String, Identity)>>,
}

#[async_trait]
impl ClusterHandler for RecordingHandler {
    async fn serve(&self, request: Request<Body>, identity: &Identity) -> Response<Body> {
        self.served
            .lock()
            .unwrap()
            .push((request.uri().path().to_string(), identity.clone()));
        Response::new(Body::from("ok"))
    }

    async fn review(&self, _review: &AccessReview) -> Result<bool> {
        Ok(true)
    }
}

/// Factory handing out one shared [`RecordingHandler`] and counting builds
pub struct RecordingFactory {
    pub handler: Arc<RecordingHandler>,
    pub builds: AtomicUsize,
    pub build_delay: Duration,
}

impl Default for RecordingFactory {
    fn default() -> Self {
        Self {
            handler: Arc::new(RecordingHandler::default()),
            builds: AtomicUsize::new(0),
            build_delay: Duration::ZERO,
        }
    }
}

impl RecordingFactory {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> Vec<(String, Identity)> {
        self.handler.served.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyFactory for RecordingFactory {
    async fn build(&self, _cluster: &Cluster) -> Result<Arc<dyn ClusterHandler>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }
        Ok(self.handler.clone())
    }
}

/// Fully assembled pipeline over in-memory stores
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub reviewer: Arc<PolicyReviewer>,
    pub factory: Arc<RecordingFactory>,
    pub router: Arc<ClusterRouter>,
    pub app: Router,
}

impl Harness {
    pub fn new(reviewer: PolicyReviewer) -> Self {
        Self::with_factory(reviewer, RecordingFactory::default())
    }

    pub fn with_factory(reviewer: PolicyReviewer, factory: RecordingFactory) -> Self {
        let store = Arc::new(MemoryStore::new());
        let reviewer = Arc::new(reviewer);
        let factory = Arc::new(factory);

        let lookup = ClusterLookup::new(store.clone(), reviewer.clone());
        let router = Arc::new(ClusterRouter::new(lookup, factory.clone()));
        let auth = TokenAuthenticator::new(
            store.clone(),
            store.clone(),
            AuthenticatorConfig::default(),
        );
        let impersonator =
            Impersonator::new(reviewer.clone(), store.clone()).with_downstream(router.clone());

        let refresher = Refresher::new(
            store.clone(),
            store.clone(),
            Vec::new(),
            Duration::from_secs(3600),
        );
        let daemon = RefreshDaemon::new(refresher, RefreshConfig::default());

        let app = app(AppState {
            auth: Arc::new(auth),
            impersonator: Arc::new(impersonator),
            router: router.clone(),
            reviewer: reviewer.clone(),
            refresh: daemon.handle(),
        });

        Self {
            store,
            reviewer,
            factory,
            router,
            app,
        }
    }

    pub fn add_user(&self, id: &str) {
        self.store.insert_user(User::new(id, UserSpec::default()));
    }

    pub fn add_token(&self, name: &str, secret: &str, user: &str, cluster: Option<&str>) {
        self.store.insert_token(token(name, secret, user, cluster));
    }

    pub fn add_cluster(&self, id: &str) {
        let mut cluster = Cluster::new(id, ClusterSpec::default());
        cluster.status = Some(ClusterStatus {
            api_endpoint: format!("https://{id}.example.com:6443"),
            ca_cert: String::new(),
            service_account_token: format!("sa-{id}"),
        });
        self.store.insert_cluster(cluster);
    }
}

pub fn token(name: &str, secret: &str, user: &str, cluster: Option<&str>) -> Token {
    Token::new(
        name,
        TokenSpec {
            secret: secret.to_string(),
            user_id: user.to_string(),
            auth_provider: "local".to_string(),
            is_derived: false,
            enabled: Some(true),
            cluster_name: cluster.map(str::to_string),
            ttl_millis: 57_600_000,
            created_at: Utc::now(),
            group_principals: vec![],
        },
    )
}

/// GET `path` with the given extra headers
pub fn get(path: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

/// Status and JSON body of an error response
pub async fn error_body(response: Response<Body>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}
