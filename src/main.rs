//! kuill - authenticating gateway for the Kubernetes API

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kuill_api::access::{AccessResolver, BackendAccessReviewer, ResourceLister};
use kuill_api::auth::{
    AnonymousAuthenticator, OidcAuthenticator, PasswordFileAuthenticator, SessionKey, SessionManager,
};
use kuill_api::backend::{BackendClient, ReqwestBackend};
use kuill_api::proxy::ProxyGateway;
use kuill_api::watch::{BackendWatchDialer, WatchAggregator};
use kuill_api::{start_server, AppState, IdentityInjector, PROXY_BASE_PATH};
use kuill_common::{
    init_telemetry, spawn_refresher, DiscoveryKindSource, KindCatalog, KubeNamespaceSource, NamespaceSet,
    Refreshable,
};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(cli.telemetry())?;

    let shutdown = CancellationToken::new();
    let state = build_state(&cli, &shutdown).await?;
    let server = cli.server_config().await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        signal.cancel();
    });

    start_server(server, state, shutdown).await?;
    info!("kuill stopped");
    Ok(())
}

/// Assemble the catalogs, backend clients and login methods
async fn build_state(cli: &Cli, shutdown: &CancellationToken) -> anyhow::Result<AppState> {
    let kube_config = cli.kube_config().await?;
    let backend_config = cli.backend_config(&kube_config).await?;
    let client = Client::try_from(kube_config).context("failed to create Kubernetes client")?;

    let kinds = Arc::new(KindCatalog::new(Arc::new(DiscoveryKindSource::new(client.clone()))));
    kinds.refresh().await.context("initial kind discovery failed")?;
    let namespaces = Arc::new(NamespaceSet::new(Arc::new(KubeNamespaceSource::new(client))));
    if let Err(e) = namespaces.refresh().await {
        warn!(error = %e, "Initial namespace listing failed, namespace fallback disabled until next refresh");
    }
    spawn_refresher(kinds.clone(), cli.kinds_refresh(), shutdown.child_token());
    spawn_refresher(namespaces.clone(), cli.namespaces_refresh(), shutdown.child_token());

    let backend: Arc<dyn BackendClient> = Arc::new(ReqwestBackend::new(&backend_config)?);
    let identity = IdentityInjector::new(cli.identity_mode()?, cli.authenticated_groups.clone());
    let proxy = ProxyGateway::new(backend.clone(), &backend_config.url, identity.clone(), PROXY_BASE_PATH)?
        .with_trace_requests(cli.trace_requests);
    let aggregator = WatchAggregator::new(
        Arc::new(BackendWatchDialer::new(backend.clone())),
        namespaces.clone(),
        cli.aggregator_config(),
    );
    let resources = ResourceLister::new(backend.clone(), kinds.clone(), namespaces.clone());
    let resolver = AccessResolver::new(
        Arc::new(BackendAccessReviewer::new(backend, identity)),
        kinds.clone(),
        namespaces.clone(),
    );

    let key = match &cli.session_secret_file {
        Some(path) => SessionKey::load(path).await?,
        None => {
            warn!("No session secret configured, sessions will not survive a restart");
            SessionKey::generate()
        }
    };
    let sessions = Arc::new(SessionManager::new(key, cli.session_config()?));
    register_login_methods(cli, &sessions).await?;

    info!(
        backend = %backend_config.url,
        kinds = kinds.snapshot().await.len(),
        namespaces = namespaces.snapshot().await.len(),
        "Gateway configured"
    );

    Ok(AppState {
        sessions,
        proxy: Arc::new(proxy),
        kinds,
        namespaces,
        aggregator: Arc::new(aggregator),
        resolver: Arc::new(resolver),
        resources: Arc::new(resources),
        tls: cli.tls_enabled(),
        watch_access_precheck: cli.watch_access_precheck,
    })
}

async fn register_login_methods(cli: &Cli, sessions: &SessionManager) -> anyhow::Result<()> {
    let mut enabled = 0;

    if let Some(config) = cli.oidc_config()? {
        sessions
            .register_authenticator(Arc::new(OidcAuthenticator::new(config)?))
            .await?;
        enabled += 1;
    }
    if let Some(path) = &cli.password_file {
        sessions
            .register_authenticator(Arc::new(PasswordFileAuthenticator::load("local", path).await?))
            .await?;
        enabled += 1;
    }
    if !cli.disable_anonymous {
        sessions
            .register_authenticator(Arc::new(AnonymousAuthenticator::new(
                cli.anonymous_user.clone(),
                cli.anonymous_groups.clone(),
            )))
            .await?;
        enabled += 1;
    }

    if enabled == 0 {
        anyhow::bail!("no login methods enabled; configure OIDC, a password file, or allow anonymous login");
    }
    Ok(())
}
