mod config;
mod error;
mod routes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, extract::FromRef, routing::get};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use devcell_api_client::GitHubConnector;
use devcell_core::RemoteConnector;
use devcell_git_native::NativeConnector;
use devcell_local_db::LocalDb;
use devcell_runtime_config::{DevcellConfig, SyncMethod};
use devcell_session::{
    Deployer, DispatcherConfig, HttpDeployer, LocalContainerProvider, SessionDispatcher,
};
use devcell_sync::{PipelineConfig, SyncService};

#[derive(Debug, Parser)]
#[command(name = "devcell-server", version, about = "Collaborative project session server")]
struct Cli {
    /// Path to devcell.toml
    #[arg(long, env = "DEVCELL_CONFIG")]
    config: Option<PathBuf>,
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: SessionDispatcher,
}

impl FromRef<AppState> for SessionDispatcher {
    fn from_ref(state: &AppState) -> Self {
        state.dispatcher.clone()
    }
}

fn pipeline_config(config: &DevcellConfig) -> PipelineConfig {
    PipelineConfig {
        branch: config.sync.branch.clone(),
        blob_batch_size: config.sync.blob_batch_size,
        fetch_batch_size: config.sync.fetch_batch_size,
        batch_delay: Duration::from_millis(config.sync.batch_delay_ms),
        project_root: format!("/{}", config.container.project_dir.trim_matches('/')),
    }
}

fn connector(config: &DevcellConfig) -> Result<Arc<dyn RemoteConnector>> {
    match (&config.sync.method, &config.sync.native_repos_root) {
        (SyncMethod::Native, Some(root)) => {
            info!("sync backend: bare repositories under {root}");
            Ok(Arc::new(NativeConnector::new(Path::new(root))))
        }
        (SyncMethod::Native, None) => {
            anyhow::bail!("sync.method = \"native\" requires sync.native_repos_root")
        }
        _ => {
            info!("sync backend: REST API at {}", config.sync.api_base_url);
            Ok(Arc::new(GitHubConnector::new(
                &config.sync.api_base_url,
                Duration::from_secs(config.sync.http_timeout_secs),
            )))
        }
    }
}

fn build_dispatcher(config: &DevcellConfig) -> Result<SessionDispatcher> {
    let store = LocalDb::open_path(Path::new(&config.sync.database_path))
        .with_context(|| format!("open sync database {}", config.sync.database_path))?;
    info!("sync database: {}", config.sync.database_path);
    let sync = Arc::new(SyncService::new(
        Arc::new(store),
        connector(config)?,
        pipeline_config(config),
    ));

    let deployer: Option<Arc<dyn Deployer>> = match &config.deploy.base_url {
        Some(url) => {
            info!("deploy service: {url}");
            let timeout = Duration::from_secs(config.server.request_timeout_secs);
            Some(Arc::new(HttpDeployer::new(url, timeout).context("build deploy client")?))
        }
        None => {
            tracing::warn!("deploy.base_url not set; deploy requests will be unavailable");
            None
        }
    };

    let provider = Arc::new(LocalContainerProvider::new(config.container.clone()));
    Ok(SessionDispatcher::new(
        DispatcherConfig {
            session: config.session.clone(),
            container: config.container.clone(),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        },
        provider,
        sync,
        deployer,
    ))
}

fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(routes::health::health))
        .route("/projects/{project_id}/ws", get(routes::ws::ws_upgrade));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "devcell_server=info,devcell_session=info,devcell_sync=info,tower_http=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;
    let dispatcher = build_dispatcher(&config)?;
    let app = build_router(AppState {
        dispatcher: dispatcher.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;
    info!("devcell-server listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            info!("shutdown signal received, closing sessions");
            dispatcher.shutdown();
        })
        .await?;

    info!("devcell-server stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
