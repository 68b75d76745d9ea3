//! CI server: webhook-driven build orchestrator.
//!
//! Receives GitHub events, runs every build in its own container and
//! reports back through commit statuses, comments and webhooks.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use ci_server::config::CiConfig;
use ci_server::services::environment_service::DockerBackend;
use ci_server::services::github_service::GitHubClient;
use ci_server::services::orchestrator::Orchestrator;
use ci_server::services::reporter::GitHubReporter;
use ci_server::store::{BuildStore, MemoryStore, PgStore};
use ci_server::{metrics, migration, routes};

#[derive(Parser)]
#[command(name = "ci-server", about = "Webhook-driven CI build orchestrator")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "CI_PORT", default_value = "9090")]
    port: u16,

    /// PostgreSQL connection URL; builds are kept in memory when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    tracing::info!("Starting CI server...");

    let config = Arc::new(CiConfig::from_env());
    let store = open_store(cli.database_url.as_deref()).await?;

    let backend = Arc::new(DockerBackend::new(config.docker.clone()));
    let reporter = Arc::new(GitHubReporter::new(
        GitHubClient::new(&config.github_api_url, &config.github_token),
        &config.status_context,
        config.webhook_timeout,
    ));
    let orchestrator = Arc::new(Orchestrator::spawn(store, backend, reporter, config));

    let app = routes::router(routes::AppState {
        orchestrator: Arc::clone(&orchestrator),
    });

    // Initialize metrics
    metrics::init_metrics();

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("CI server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping running builds...");
    orchestrator.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn BuildStore>> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set -- builds are kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let store = PgStore::connect(url)?;
    {
        let mut conn = store
            .pool()
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        tracing::info!("Running database migration...");
        migration::run_migration(&mut conn).await?;
        tracing::info!("Database migration completed.");
    }
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
