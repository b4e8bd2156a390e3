//! corral - multi-cluster request pipeline

mod config;

use std::sync::Arc;

use clap::Parser;
use corral_api::access::{AccessReviewer, KubeAccessReviewer};
use corral_api::remote::{DefaultDialerFactory, RemoteProxyFactory, TunnelRegistry};
use corral_api::server::{serve, AppState};
use corral_api::{
    AuthChain, Authenticator, ClusterLookup, ClusterRouter, Impersonator, SaAuthenticator,
    TokenAuthenticator,
};
use corral_common::crd::{Cluster, Token, User, UserAttribute};
use corral_common::kube_store::KubeStores;
use corral_common::telemetry::init_logging;
use corral_refresh::{IdentityProvider, LocalProvider, RefreshDaemon, Refresher};
use kube::{Client, CustomResourceExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("failed to install the aws-lc-rs crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    init_logging(cli.logging())?;
    run(cli).await
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [Token::crd(), User::crd(), UserAttribute::crd(), Cluster::crd()];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let client = Client::try_default().await?;
    let stores = KubeStores::start(client.clone(), cancel.clone());

    // Refresh daemon
    let providers: Vec<Arc<dyn IdentityProvider>> = vec![Arc::new(LocalProvider)];
    let refresh_config = cli.refresh();
    let refresher = Refresher::new(
        stores.users.clone(),
        stores.tokens.clone(),
        providers,
        refresh_config.max_age,
    );
    let daemon = RefreshDaemon::new(refresher, refresh_config);
    let refresh = daemon.handle();
    let refresh_task = daemon.spawn(cancel.clone());

    // Authentication
    let token_auth = TokenAuthenticator::new(
        stores.tokens.clone(),
        stores.users.clone(),
        cli.authenticator(),
    )
    .with_refresh_trigger(Arc::new(refresh.clone()));
    let mut chain = AuthChain::default().with(Arc::new(token_auth));
    if cli.sa_auth {
        let sa_auth = if cli.sa_audiences.is_empty() {
            SaAuthenticator::new(client.clone())
        } else {
            SaAuthenticator::with_audiences(client.clone(), cli.sa_audiences.clone())
        };
        chain = chain.with(Arc::new(sa_auth));
    }
    info!(links = chain.len(), "Authenticator chain ready");
    let auth: Arc<dyn Authenticator> = Arc::new(chain);

    // Routing
    let reviewer: Arc<dyn AccessReviewer> = Arc::new(KubeAccessReviewer::new(client));
    let tunnels = Arc::new(TunnelRegistry::new());
    let factory = RemoteProxyFactory::new(
        Arc::new(DefaultDialerFactory::new(tunnels)),
        cli.proxy(),
    );
    let lookup = ClusterLookup::new(stores.clusters.clone(), reviewer.clone());
    let router = Arc::new(ClusterRouter::new(lookup, Arc::new(factory)));
    tokio::spawn(invalidate_deleted_clusters(
        stores.cluster_index.deletions(),
        router.clone(),
        cancel.clone(),
    ));

    let impersonator = Impersonator::new(reviewer.clone(), stores.tokens.clone())
        .with_downstream(router.clone());

    let state = AppState {
        auth,
        impersonator: Arc::new(impersonator),
        router,
        reviewer,
        refresh,
    };

    tokio::spawn(shutdown_on_signal(cancel.clone()));
    serve(cli.server(), state, cancel.clone()).await?;

    cancel.cancel();
    if let Err(e) = refresh_task.await {
        warn!(error = %e, "Refresh daemon task failed");
    }
    for watcher in stores.watchers {
        let _ = watcher.await;
    }
    info!("corral stopped");
    Ok(())
}

/// Drop cached proxies of clusters removed from the store
async fn invalidate_deleted_clusters(
    mut deletions: tokio::sync::broadcast::Receiver<String>,
    router: Arc<ClusterRouter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            deleted = deletions.recv() => match deleted {
                Ok(cluster_id) => router.invalidate(&cluster_id),
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "Missed cluster deletions, clearing proxy cache");
                    router.clear();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    cancel.cancel();
}
