//! mcp-relay — command-line entry point.
//!
//! Parses [`Config`], builds the [`SessionManager`] around the configured
//! upstream, and serves the HTTP front end until `SIGINT`/`SIGTERM`.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bridge;
mod client;
mod config;
mod error;
mod http;
mod server;
mod session_manager;

use config::Config;
use session_manager::{ManagerConfig, SessionManager};

/// §6 "close in-flight requests within a 1 second grace period" on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = Config::parse();

    let upstream = match config.upstream() {
        Ok(upstream) => upstream,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let manager = SessionManager::new(ManagerConfig {
        upstream,
        dynamic_proxy: config.dynamic_proxy,
        ..ManagerConfig::default()
    });

    let router = http::build_router(&config, manager);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error: failed to bind port {}: {e}", config.port);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        port = config.port,
        server = ?config.server,
        sse_endpoint = %config.sse_endpoint,
        stream_endpoint = %config.stream_endpoint,
        "mcp-relay listening"
    );

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = result {
        eprintln!("Error: server failed: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}
