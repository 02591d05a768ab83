//! Application entry point and server initialization
//!
//! This module contains the main function that:
//! - Loads environment configuration
//! - Initializes the database
//! - Spawns the analytics retention task
//! - Starts the HTTP server with graceful shutdown support

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use newsletter::config::Config;
use newsletter::database::{init_db, purge_analytics_before, AppState};
use newsletter::route::create_app;
use newsletter::transport::LogTransport;

/// How often expired analytics are purged
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Application entry point
///
/// See [`Config::from_env`] for the environment variables read at startup.
#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("newsletter=debug,tower_http=debug")),
        )
        .init();

    let config = Config::from_env();

    let db = match init_db(&config.database_url) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, path = %config.database_url, "failed to initialize database");
            std::process::exit(1);
        }
    };

    let state = AppState {
        db: db.clone(),
        transport: Arc::new(LogTransport),
        config: Arc::new(config.clone()),
    };

    tokio::spawn(purge_expired_analytics(db, config.analytics_retention_days));

    let app = create_app(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(%addr, database = %config.database_url, base_url = %config.base_url, "server running");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
    }
}

/// Periodically deletes analytics older than the retention window
async fn purge_expired_analytics(db: Arc<redb::Database>, retention_days: i64) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        match purge_analytics_before(&db, cutoff) {
            Ok(0) => {}
            Ok(purged) => info!(purged, %cutoff, "expired analytics purged"),
            Err(err) => warn!(error = %err, "analytics purge failed"),
        }
    }
}

/// Handles graceful shutdown signals
///
/// Returns when SIGINT (Ctrl+C) or, on Unix, SIGTERM is received so that open
/// connections can finish and no write transaction is cut off mid-commit.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
