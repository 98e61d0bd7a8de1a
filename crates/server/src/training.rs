//! Training orchestration: cold start, nightly refits, artifact persistence,
//! and atomic model swaps.
//!
//! CPU-heavy fitting runs on the blocking pool so it never starves ingest.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use headway_compute::detect::ModelKind;
use headway_compute::train::{
    build_line_series, decode_artifact, encode_artifact, fit_outlier_model, fit_sequence_model,
    OutlierModel, SequenceModel, OUTLIER_MODEL_NAME, SEQUENCE_MODEL_NAME,
};
use headway_compute::{FeatureEngine, FrameVector};
use headway_store::PositionQuery;

use crate::state::AppState;

/// Positions loaded per training run; bounds memory on wide windows.
const TRAINING_POSITION_LIMIT: i64 = 200_000;

/// Install persisted artifacts, training from scratch where none exist.
pub async fn cold_start(state: Arc<AppState>) {
    match state.store.get_latest_artifact(OUTLIER_MODEL_NAME).await {
        Ok(Some(artifact)) => match decode_artifact::<OutlierModel>(&artifact.payload) {
            Ok(mut model) => {
                model.version = artifact.version;
                info!(version = artifact.version, "outlier model restored from artifact");
                state.detector.install_outlier(model);
            }
            Err(e) => {
                warn!("stored outlier artifact undecodable ({}), retraining", e);
                train_outlier(&state).await;
            }
        },
        Ok(None) => {
            info!("no outlier artifact; cold-start training");
            train_outlier(&state).await;
        }
        Err(e) => warn!("artifact lookup failed: {}", e),
    }

    if !state.config.detector.sequence_model_enabled {
        info!("sequence model disabled by configuration");
        return;
    }
    match state.store.get_latest_artifact(SEQUENCE_MODEL_NAME).await {
        Ok(Some(artifact)) => match decode_artifact::<SequenceModel>(&artifact.payload) {
            Ok(mut model) => {
                model.version = artifact.version;
                info!(version = artifact.version, "sequence model restored from artifact");
                state.detector.install_sequence(model);
            }
            Err(e) => {
                warn!("stored sequence artifact undecodable ({}), retraining", e);
                train_sequence(&state).await;
            }
        },
        Ok(None) => {
            info!("no sequence artifact; cold-start training");
            train_sequence(&state).await;
        }
        Err(e) => warn!("artifact lookup failed: {}", e),
    }
}

/// Nightly refit of both models. A failed run keeps the serving models.
pub async fn train_all(state: Arc<AppState>) {
    info!("nightly retrain starting");
    train_outlier(&state).await;
    if state.config.detector.sequence_model_enabled {
        train_sequence(&state).await;
    }
    info!("nightly retrain finished");
}

/// Replay recent positions through a fresh engine to rebuild the training
/// frames the windows would have produced.
async fn training_frames(state: &Arc<AppState>) -> Option<Vec<FrameVector>> {
    let since = Utc::now() - chrono::Duration::hours(state.config.detector.training_window_hours as i64);
    let query = PositionQuery {
        since: Some(since),
        limit: TRAINING_POSITION_LIMIT,
        ..Default::default()
    };
    let positions = match state.store.query_positions(&query).await {
        Ok(p) => p,
        Err(e) => {
            warn!("training data load failed: {}", e);
            return None;
        }
    };

    let catalog = Arc::clone(&state.catalog);
    let features_config = state.config.features.clone();
    let frames = tokio::task::spawn_blocking(move || {
        let mut engine = FeatureEngine::new(&features_config);
        positions
            .iter()
            .filter_map(|r| engine.update(r, &catalog))
            .collect::<Vec<FrameVector>>()
    })
    .await
    .ok()?;

    Some(frames)
}

async fn train_outlier(state: &Arc<AppState>) {
    state.detector.begin_training(ModelKind::Outlier);
    let Some(frames) = training_frames(state).await else {
        training_failed(state, ModelKind::Outlier, "no training data");
        return;
    };

    let vectors: Vec<[f64; 5]> = frames.iter().map(|f| f.vector).collect();
    let contamination = state.config.detector.contamination;
    let seed = Utc::now().timestamp() as u64;

    let fitted =
        tokio::task::spawn_blocking(move || fit_outlier_model(&vectors, contamination, seed)).await;

    let mut model = match fitted {
        Ok(Ok(model)) => model,
        Ok(Err(e)) => {
            training_failed(state, ModelKind::Outlier, &e.to_string());
            return;
        }
        Err(e) => {
            training_failed(state, ModelKind::Outlier, &e.to_string());
            return;
        }
    };

    let payload = match encode_artifact(&model) {
        Ok(p) => p,
        Err(e) => {
            training_failed(state, ModelKind::Outlier, &e.to_string());
            return;
        }
    };

    match state
        .store
        .put_model_artifact(
            OUTLIER_MODEL_NAME,
            &payload,
            &model.hyperparams(),
            state.config.detector.training_window_hours,
        )
        .await
    {
        Ok(version) => {
            model.version = version;
            info!(version, threshold = model.threshold, "outlier model trained and swapped");
            state.detector.install_outlier(model);
        }
        Err(e) => training_failed(state, ModelKind::Outlier, &e.to_string()),
    }
}

async fn train_sequence(state: &Arc<AppState>) {
    state.detector.begin_training(ModelKind::Sequence);
    let Some(frames) = training_frames(state).await else {
        training_failed(state, ModelKind::Sequence, "no training data");
        return;
    };

    let tick = chrono::Duration::seconds(state.config.feed.update_interval_s as i64);
    let sequence_length = state.config.detector.sequence_length as usize;
    let hidden_size = state.config.detector.hidden_size as usize;
    let seed = Utc::now().timestamp() as u64 ^ 0xae;

    let fitted = tokio::task::spawn_blocking(move || {
        let series = build_line_series(&frames, tick);
        fit_sequence_model(&series, sequence_length, hidden_size, seed)
    })
    .await;

    let mut model = match fitted {
        Ok(Ok(model)) => model,
        Ok(Err(e)) => {
            training_failed(state, ModelKind::Sequence, &e.to_string());
            return;
        }
        Err(e) => {
            training_failed(state, ModelKind::Sequence, &e.to_string());
            return;
        }
    };

    let payload = match encode_artifact(&model) {
        Ok(p) => p,
        Err(e) => {
            training_failed(state, ModelKind::Sequence, &e.to_string());
            return;
        }
    };

    match state
        .store
        .put_model_artifact(
            SEQUENCE_MODEL_NAME,
            &payload,
            &model.hyperparams(),
            state.config.detector.training_window_hours,
        )
        .await
    {
        Ok(version) => {
            model.version = version;
            info!(version, p95 = model.error_p95, "sequence model trained and swapped");
            state.detector.install_sequence(model);
        }
        Err(e) => training_failed(state, ModelKind::Sequence, &e.to_string()),
    }
}

fn training_failed(state: &Arc<AppState>, kind: ModelKind, reason: &str) {
    warn!(model = ?kind, "training_failed: {}", reason);
    state.ingest.training_failed.fetch_add(1, Ordering::Relaxed);
    state.detector.training_failed(kind);
}
