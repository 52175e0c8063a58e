//! FogLAMP storage service - readings engine behind an HTTP API.
//!
//! Run with: `cargo run -p foglamp-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use foglamp_service::config::default_config_path;
use foglamp_service::{api, AppState, Config};
use foglamp_store::ReadingsStore;

/// FogLAMP storage service - SQLite readings engine and HTTP API.
#[derive(Parser, Debug)]
#[command(name = "foglamp-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Disable the background purge task.
    #[arg(long)]
    no_purge: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("foglamp_service=info".parse()?)
                .add_directive("foglamp_store=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    config.validate()?;

    info!("Opening database at {:?}", config.storage.path);
    let store = ReadingsStore::open(&config.storage.path)?;
    let state = AppState::new(store, config.clone());

    if config.purge.enabled && !args.no_purge {
        spawn_purge_task(Arc::clone(&state));
    } else {
        info!("Background purge disabled");
    }

    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr: SocketAddr = config.server.bind.parse()?;
    info!("Starting storage service on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Graceful shutdown complete");
    Ok(())
}

/// Run the scheduled purge on its configured interval. The purge itself is
/// blocking work, so each cycle runs on the blocking pool.
fn spawn_purge_task(state: Arc<AppState>) {
    let purge = state.config.purge.clone();
    info!(
        interval_secs = purge.interval_secs,
        age_hours = purge.age_hours,
        "Scheduled purge enabled"
    );

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(purge.interval_secs));
        // The first tick fires immediately; skip it so a restart loop
        // doesn't purge on every boot.
        interval.tick().await;

        loop {
            interval.tick().await;
            let store = Arc::clone(&state.store);
            let flags = if purge.retain_unsent {
                foglamp_store::FLAG_RETAIN_UNSENT
            } else {
                0
            };
            let age = purge.age_hours;
            let outcome =
                tokio::task::spawn_blocking(move || store.purge_readings_by_age(age, flags, 0))
                    .await;
            match outcome {
                Ok(Ok(result)) => info!(
                    removed = result.removed,
                    remaining = result.readings_remaining,
                    "Scheduled purge complete"
                ),
                Ok(Err(e)) => error!(error = %e, "Scheduled purge failed"),
                Err(e) => error!(error = %e, "Scheduled purge panicked"),
            }
        }
    });
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping service...");
}
