mod config;
mod error;
mod gate;
mod identifier;
mod links;
mod server;
mod transcode;
mod transfer;
mod ytdlp;

use std::{sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::ApiError,
    gate::{AdmissionGate, AdmissionMode},
    server::{AppState, create_router},
    transfer::{STALE_JOB_AGE, cleanup_stale_jobs},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ytgate=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the transfer folder: {error}"))
        })?;
    cleanup_stale_jobs(&config.transfer_dir, STALE_JOB_AGE).await;

    if config.proxies.is_empty() {
        warn!("No PROXY_URL_* configured. Extraction calls will go out directly.");
    } else {
        info!("Rotating across {} egress proxies.", config.proxies.len());
    }
    if config.admission_mode == AdmissionMode::Reserve {
        info!("Admission gate reserves attempt slots atomically.");
    }
    info!(
        window_secs = config.gate.window.as_secs(),
        threshold = config.gate.threshold,
        "Admission gate configured"
    );

    let bind_addr = config.bind_addr.clone();
    let gate = Arc::new(AdmissionGate::new(config.gate, &config.proxies));
    spawn_gate_sweeper(Arc::clone(&gate));

    let state = AppState::with_gate(config, gate)?;
    let app = create_router(state)?;

    let listener = TcpListener::bind(&bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {bind_addr}: {error}"))
    })?;

    info!("Listening on http://{bind_addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// Evicts identifiers whose attempts have all aged out, once per window.
fn spawn_gate_sweeper(gate: Arc<AdmissionGate>) {
    let period = gate.settings().window.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = gate.sweep();
            if evicted > 0 {
                debug!(evicted, remaining = gate.tracked_identifiers(), "swept admission history");
            }
        }
    });
}
