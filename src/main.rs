use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dotenvy::Error as DotenvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgdash::app::AppContext;
use pgdash::maintenance::{PgMaintenanceBackend, SshRemote};
use pgdash::probe::PgProbeClient;
use pgdash::users::PgRoleStore;
use pgdash::{config, db, http, metrics, notify, poller, setup, state};

#[derive(Debug, Parser)]
#[command(author, version, about = "PostgreSQL health dashboard and maintenance service")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env PGDASH_CONFIG or built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and the threshold watch (default).
    Serve,
    /// Create and seed the role table, then exit.
    SetupRoles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::SetupRoles => setup_roles(config).await,
    }
}

async fn serve(config: config::AppConfig) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = metrics::AppMetrics::new()?;
    let state = state::SharedState::new();
    let notifier = notify::from_config(&config.notifiers)?;
    let pool = db::create_pool(&config).await?;
    let admin_pool = if config.admin_dsn.is_empty() {
        warn!("PGDASH_ADMIN_DSN not set: maintenance and role management disabled");
        None
    } else {
        Some(db::create_admin_pool(&config).await?)
    };
    let remote = SshRemote::new(&config.remote);

    let mut ctx = AppContext::new(
        config,
        Arc::new(PgProbeClient::new(pool)),
        metrics,
        state,
        notifier,
    );
    if let Some(admin_pool) = admin_pool {
        ctx = ctx.with_admin(
            Arc::new(PgMaintenanceBackend::new(admin_pool.clone())),
            Arc::new(remote),
            Arc::new(PgRoleStore::new(admin_pool)),
        );
    }

    let poller_handles = poller::spawn_all(ctx.clone());
    let router = http::create_router(ctx.clone());

    info!(cluster = ctx.cluster_name(), "pgdash listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    shutdown_pollers(poller_handles).await;
    Ok(())
}

async fn setup_roles(config: config::AppConfig) -> anyhow::Result<()> {
    if config.admin_dsn.is_empty() {
        bail!("setup-roles requires PGDASH_ADMIN_DSN");
    }
    let pool = db::create_admin_pool(&config).await?;
    let seeded = setup::ensure_role_schema(&pool).await?;
    info!(seeded, "role setup complete");
    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pgdash=info,audit=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = ?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

async fn shutdown_pollers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}
