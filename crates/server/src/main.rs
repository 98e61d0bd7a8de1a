//! headway-server: realtime transit anomaly detection backend.
//!
//! Startup order: config → catalog (fatal if missing) → store + migrations →
//! window replay → cold-start training → background loops → HTTP/WS serve.

mod api;
mod bus;
mod live;
mod router;
mod scheduler;
mod state;
mod training;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use headway_catalog::{Catalog, CatalogError};
use headway_compute::{Detector, FeatureEngine};
use headway_core::config::{load_dotenv, Config};
use headway_core::{Route, Station};
use headway_store::{PositionQuery, StateStore};

use crate::bus::AnomalyBus;
use crate::state::{AppState, IngestMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env();
    config.log_summary();

    let catalog = match Catalog::load(&config.catalog.bundle_path) {
        Ok(c) => Arc::new(c),
        Err(e @ CatalogError::Missing(_)) => {
            error!("catalog_missing: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("catalog load failed: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(StateStore::connect(&config.store.database_url).await?);

    // Mirror the catalog into the store; conflicts keep existing rows.
    let stations: Vec<Station> = catalog.stations().cloned().collect();
    let routes: Vec<Route> = catalog.routes().cloned().collect();
    store.upsert_stations(&stations).await?;
    store.upsert_routes(&routes).await?;
    info!("catalog mirrored: {} stations, {} routes", stations.len(), routes.len());

    let (frames_tx, frames_rx) = mpsc::channel(1024);
    let (trigger_tx, trigger_rx) = mpsc::channel(4);

    let state = Arc::new(AppState {
        catalog,
        store,
        engine: Mutex::new(FeatureEngine::new(&config.features)),
        detector: Arc::new(Detector::new(config.detector.clone())),
        bus: AnomalyBus::new(config.ws.max_connections),
        ingest: IngestMetrics::new(),
        frames_tx,
        detect_trigger: trigger_tx,
        shutdown: CancellationToken::new(),
        config,
    });

    replay_windows(&state).await;
    tokio::spawn(training::cold_start(state.clone()));

    let background = scheduler::spawn_all(state.clone(), frames_rx, trigger_rx);

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let app = router::build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(state.clone()))
        .await?;

    // Loops observe the cancelled token; subscribers close with `shutdown`.
    state.bus.shutdown();
    for handle in background {
        if tokio::time::timeout(scheduler::SHUTDOWN_GRACE, handle)
            .await
            .is_err()
        {
            warn!("background task did not drain within grace period");
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Sliding windows are ephemeral; rebuild them from stored positions newer
/// than the widest window.
async fn replay_windows(state: &Arc<AppState>) {
    let horizon = state.engine.lock().unwrap().replay_horizon();
    let query = PositionQuery {
        since: Some(Utc::now() - horizon),
        limit: 100_000,
        ..Default::default()
    };
    match state.store.query_positions(&query).await {
        Ok(positions) => {
            let rebuilt = {
                let mut engine = state.engine.lock().unwrap();
                engine.replay(&positions, &state.catalog)
            };
            info!("windows rebuilt from {} stored positions ({} frames)", positions.len(), rebuilt);
        }
        Err(e) => warn!("window replay failed (starting cold): {}", e),
    }
}

async fn wait_for_shutdown(state: Arc<AppState>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal received; draining");
    state.shutdown.cancel();
}
