//! `chatlink-backend`: reference chat backend for local development.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin chatlink-backend
//!
//! # Custom address, close sessions idle for three minutes
//! cargo run --bin chatlink-backend -- --bind 127.0.0.1:8080 --idle-timeout-secs 180
//! ```

use std::sync::Arc;

use chatlink_backend::backend::{self, BackendState};
use chatlink_backend::config::{BackendCliArgs, BackendConfig};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = BackendCliArgs::parse();

    let config = match BackendConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        ping_interval = ?config.ping_interval,
        idle_timeout = ?config.idle_timeout,
        "starting chatlink backend"
    );

    let state = Arc::new(BackendState::with_settings(config.session_settings()));

    match backend::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "backend listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "backend server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start backend");
            std::process::exit(1);
        }
    }
}
