//! HTTP router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;
use crate::{api, live};

/// Assemble all routes, middleware, and state into a single `Router`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/anomalies", get(api::anomalies::list))
        .route("/anomalies/stats", get(api::anomalies::stats))
        .route("/anomalies/detect", post(api::anomalies::detect))
        .route("/feeds/positions/{line}", get(api::feeds::positions))
        .route("/feeds/status", get(api::feeds::status))
        .route("/stations", get(api::stations::list))
        .route("/health/live", get(api::health::live))
        .route("/health/ready", get(api::health::ready))
        .route("/ws", get(live::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;
    use uuid::Uuid;

    use headway_catalog::Catalog;
    use headway_compute::{Detector, FeatureEngine, FrameVector};
    use headway_core::config::Config;
    use headway_core::{Anomaly, AnomalyKind};
    use headway_store::StateStore;

    use crate::bus::AnomalyBus;
    use crate::state::{AppState, IngestMetrics};

    /// Receivers must stay alive for the trigger/frames senders to work.
    pub(crate) struct TestRig {
        pub state: Arc<AppState>,
        pub frames_rx: mpsc::Receiver<Vec<FrameVector>>,
        pub trigger_rx: mpsc::Receiver<()>,
    }

    pub(crate) async fn test_rig() -> TestRig {
        test_rig_with_catalog(Catalog::default()).await
    }

    pub(crate) async fn test_rig_with_catalog(catalog: Catalog) -> TestRig {
        let config = Config::from_env();
        let store = Arc::new(StateStore::connect_in_memory().await.unwrap());
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (trigger_tx, trigger_rx) = mpsc::channel(4);

        let state = Arc::new(AppState {
            catalog: Arc::new(catalog),
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
        TestRig {
            state,
            frames_rx,
            trigger_rx,
        }
    }

    async fn get_json(rig: &TestRig, uri: &str) -> (StatusCode, serde_json::Value) {
        let app = build_router(rig.state.clone());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn sample_anomaly(severity: f64) -> Anomaly {
        Anomaly {
            anomaly_id: Uuid::new_v4(),
            detected_at: chrono::Utc::now(),
            station_id: Some("635".into()),
            route_id: Some("6".into()),
            kind: AnomalyKind::HeadwayOutlier,
            severity,
            model_name: "isolation_forest".into(),
            model_version: 1,
            features: BTreeMap::new(),
            resolved: false,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn health_live_is_always_ok() {
        let rig = test_rig().await;
        let (status, body) = get_json(&rig, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn health_ready_requires_catalog_and_fresh_ingest() {
        let rig = test_rig().await;
        let (status, body) = get_json(&rig, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
        // Empty catalog and no feed runs yet.
        assert_eq!(body["catalog"], false);
        assert_eq!(body["store"], true);
        assert_eq!(body["ingest_fresh"], false);
        assert_eq!(body["outlier_model"], "absent");
    }

    #[tokio::test]
    async fn health_ready_ok_with_catalog_and_recent_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stops.txt"),
            "stop_id,stop_name,stop_lat,stop_lon,parent_station\n635,Union Sq,40.73,-73.99,\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("routes.txt"),
            "route_id,route_short_name,route_long_name,route_color\n6,6,Lexington Local,00933C\n",
        )
        .unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        let rig = test_rig_with_catalog(catalog).await;

        // One feed failing forever does not break readiness as long as some
        // feed ran recently.
        let now = chrono::Utc::now();
        rig.state
            .store
            .insert_feed_run(&headway_core::FeedRun {
                run_id: 0,
                feed_id: "ace".into(),
                started_at: now,
                finished_at: now,
                entities_seen: 0,
                alerts_seen: 0,
                skipped: 0,
                status: headway_core::FeedRunStatus::TransportError,
                duration_ms: 30_000,
            })
            .await
            .unwrap();
        rig.state
            .store
            .insert_feed_run(&headway_core::FeedRun {
                run_id: 0,
                feed_id: "1234567".into(),
                started_at: now,
                finished_at: now,
                entities_seen: 3,
                alerts_seen: 0,
                skipped: 0,
                status: headway_core::FeedRunStatus::Ok,
                duration_ms: 900,
            })
            .await
            .unwrap();

        let (status, body) = get_json(&rig, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["catalog"], true);
        assert_eq!(body["ingest_fresh"], true);
    }

    #[tokio::test]
    async fn anomalies_list_pages_and_filters() {
        let rig = test_rig().await;
        for i in 0..3 {
            rig.state
                .store
                .insert_anomaly(&sample_anomaly(0.5 + i as f64 * 0.2))
                .await
                .unwrap();
        }

        let (status, body) = get_json(&rig, "/anomalies?page=1&page_size=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["anomalies"].as_array().unwrap().len(), 2);
        assert_eq!(body["page_size"], 2);

        let (status, body) = get_json(&rig, "/anomalies?severity_min=0.8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        // Out-of-range severity filter is a 4xx with the uniform envelope.
        let (status, body) = get_json(&rig, "/anomalies?severity_min=2.5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "bad_request");
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn anomaly_stats_shape() {
        let rig = test_rig().await;
        rig.state.store.insert_anomaly(&sample_anomaly(0.9)).await.unwrap();

        let (status, body) = get_json(&rig, "/anomalies/stats?hours=24").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_today"], 1);
        assert_eq!(body["total_active"], 1);
        assert_eq!(body["by_type"]["headway_outlier"], 1);
        assert_eq!(body["by_line"]["6"], 1);
        assert_eq!(body["severity_distribution"]["high"], 1);
        assert!(body["trend_24h"].is_array());
    }

    #[tokio::test]
    async fn detect_trigger_enqueues_a_tick() {
        let mut rig = test_rig().await;
        let app = build_router(rig.state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/anomalies/detect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["triggered"], true);

        // The one-shot landed on the trigger channel.
        assert!(rig.trigger_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stations_empty_and_bad_bbox() {
        let rig = test_rig().await;
        let (status, body) = get_json(&rig, "/stations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 0);

        let (status, body) = get_json(&rig, "/stations?bbox=oops").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "bad_request");
    }

    #[tokio::test]
    async fn feed_status_reports_stale_without_ticks() {
        let rig = test_rig().await;
        let (status, body) = get_json(&rig, "/feeds/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stale");
        assert_eq!(body["last_runs"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn positions_endpoint_returns_latest_snapshot() {
        let rig = test_rig().await;
        let (status, body) = get_json(&rig, "/feeds/positions/6").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let rig = test_rig().await;
        let app = build_router(rig.state.clone());
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
