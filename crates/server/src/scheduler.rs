//! Recurrent timers: ingest ticks, detection coalescing, retention purge,
//! and the nightly retrain. All loops hang off the root cancellation token
//! and drain within the shutdown grace period.

use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use headway_compute::{FrameVector, ScoreDecision};
use headway_core::{FeedRun, FeedRunStatus};
use headway_feed::{decode_feed, feed_descriptors, FeedDescriptor, Fetcher};
use headway_store::StoreError;

use crate::state::AppState;
use crate::training;

/// Detection completions arriving within this window collapse into one tick.
const DETECTION_COALESCE: Duration = Duration::from_secs(1);

/// In-flight fetches get this long to finish at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Base position-insert chunk; the backpressure divisor shrinks it.
const BASE_CHUNK: usize = 1024;

const MAX_BATCH_DIVISOR: u32 = 16;

/// Spawn every background loop. The returned handles finish once the root
/// token is cancelled and draining completes.
pub fn spawn_all(
    state: Arc<AppState>,
    frames_rx: mpsc::Receiver<Vec<FrameVector>>,
    trigger_rx: mpsc::Receiver<()>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_ingest_loop(state.clone())),
        tokio::spawn(run_detection_loop(state.clone(), frames_rx, trigger_rx)),
        tokio::spawn(run_purge_loop(state.clone())),
        tokio::spawn(run_retrain_loop(state)),
    ]
}

// ── Ingest ────────────────────────────────────────────────────

pub async fn run_ingest_loop(state: Arc<AppState>) {
    let fetcher = match Fetcher::new(state.config.feed.timeout(), state.config.feed.max_retries) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!("cannot build feed fetcher: {}", e);
            return;
        }
    };
    let descriptors = feed_descriptors(&state.config.feed.base_url, state.config.feed.timeout());
    info!("ingest loop started: {} feeds every {}s", descriptors.len(), state.config.feed.update_interval_s);

    let mut tick = tokio::time::interval(state.config.feed.update_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        state.ingest.ticks.fetch_add(1, Ordering::Relaxed);
        // Reap finished fetch tasks without blocking the tick.
        while in_flight.try_join_next().is_some() {}

        let shed_feeds = assess_backpressure(&state);

        for desc in &descriptors {
            // Per-feed serialization: an overlapping tick skips the feed.
            if !state.ingest.try_begin(&desc.feed_id) {
                state.ingest.overlap_skips.fetch_add(1, Ordering::Relaxed);
                warn!(feed = %desc.feed_id, "overlap: previous fetch still in flight");
                continue;
            }
            let shed = shed_feeds.contains(&desc.feed_id);
            in_flight.spawn(ingest_one(
                state.clone(),
                fetcher.clone(),
                desc.clone(),
                shed,
            ));
        }

        state
            .ingest
            .last_tick_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    // Structured drain: give in-flight fetches the grace period, then drop.
    info!("ingest loop draining {} in-flight fetches", in_flight.len());
    let drain = async {
        while in_flight.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace expired with fetches still in flight");
    }
}

/// Inspect store write latency and adjust the ingest posture.
fn assess_backpressure(state: &Arc<AppState>) -> std::collections::HashSet<String> {
    let p95 = state.store.write_p95();
    let high = Duration::from_millis(state.config.store.write_high_watermark_ms);
    let drop_mark = Duration::from_millis(state.config.store.write_drop_watermark_ms);

    if p95 > high {
        state.ingest.backpressure.store(true, Ordering::Relaxed);
        let divisor = state.ingest.batch_divisor.load(Ordering::Relaxed);
        let doubled = (divisor * 2).min(MAX_BATCH_DIVISOR);
        state.ingest.batch_divisor.store(doubled, Ordering::Relaxed);
        warn!(p95_ms = p95.as_millis() as u64, divisor = doubled, "write latency over high watermark");
    } else {
        state.ingest.backpressure.store(false, Ordering::Relaxed);
        let divisor = state.ingest.batch_divisor.load(Ordering::Relaxed);
        if divisor > 1 {
            state.ingest.batch_divisor.store(divisor / 2, Ordering::Relaxed);
        }
    }

    if p95 > drop_mark {
        let victims = state.ingest.slowest_feeds();
        if !victims.is_empty() {
            state
                .ingest
                .shedding
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            warn!(feeds = ?victims, "ingest_shedding: skipping decode for slowest feeds");
        }
        victims
    } else {
        Default::default()
    }
}

/// One feed, one tick: fetch → decode → durable write → feature update.
/// Every outcome records exactly one FeedRun.
async fn ingest_one(state: Arc<AppState>, fetcher: Arc<Fetcher>, desc: FeedDescriptor, shed: bool) {
    let started_at = Utc::now();
    let t0 = Instant::now();

    let run_of = |status: FeedRunStatus, entities: u32, alerts: u32, skipped: u32| FeedRun {
        run_id: 0,
        feed_id: desc.feed_id.clone(),
        started_at,
        finished_at: Utc::now(),
        entities_seen: entities,
        alerts_seen: alerts,
        skipped,
        status,
        duration_ms: t0.elapsed().as_millis() as u64,
    };

    let body = match fetcher.fetch(&desc).await {
        Ok(body) => body,
        Err(e) => {
            warn!(feed = %desc.feed_id, "fetch failed after retries: {}", e);
            state.ingest.runs_failed.fetch_add(1, Ordering::Relaxed);
            persist_run(&state, &run_of(FeedRunStatus::TransportError, 0, 0, 0)).await;
            state.ingest.finish(&desc.feed_id, t0.elapsed().as_millis() as u64);
            return;
        }
    };

    if shed {
        // Backpressure: the body is dropped undecoded, but the attempt is
        // still on record.
        persist_run(&state, &run_of(FeedRunStatus::Partial, 0, 0, 0)).await;
        state.ingest.finish(&desc.feed_id, t0.elapsed().as_millis() as u64);
        return;
    }

    let outcome = match decode_feed(&body) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(feed = %desc.feed_id, "decode failed: {}", e);
            state.ingest.runs_failed.fetch_add(1, Ordering::Relaxed);
            persist_run(&state, &run_of(FeedRunStatus::DecodeError, 0, 0, 0)).await;
            state.ingest.finish(&desc.feed_id, t0.elapsed().as_millis() as u64);
            return;
        }
    };

    let status = if outcome.is_partial() {
        FeedRunStatus::Partial
    } else {
        FeedRunStatus::Ok
    };
    let run = run_of(
        status,
        outcome.entities_seen,
        outcome.alerts_seen,
        outcome.skipped,
    );

    // Durable write first; feature windows only advance over stored rows.
    let chunk = chunk_size(&state);
    let (head, rest) = outcome
        .records
        .split_at(outcome.records.len().min(chunk));

    let mut durable = write_with_retry(&state, || async {
        state.store.record_ingest(&run, head).await.map(|_| ())
    })
    .await;

    if durable {
        for chunk_rows in rest.chunks(chunk.max(1)) {
            let ok = write_with_retry(&state, || async {
                state.store.insert_positions(chunk_rows).await.map(|_| ())
            })
            .await;
            if !ok {
                durable = false;
                break;
            }
        }
    }

    if !durable {
        state.ingest.runs_failed.fetch_add(1, Ordering::Relaxed);
        state.ingest.finish(&desc.feed_id, t0.elapsed().as_millis() as u64);
        let _ = state.frames_tx.send(Vec::new()).await;
        return;
    }

    state.ingest.runs_ok.fetch_add(1, Ordering::Relaxed);

    // CPU-bound feature math under the lock, no await inside.
    let frames: Vec<FrameVector> = {
        let mut engine = state.engine.lock().unwrap();
        outcome
            .records
            .iter()
            .filter_map(|r| engine.update(r, &state.catalog))
            .collect()
    };
    debug!(feed = %desc.feed_id, records = outcome.records.len(), frames = frames.len(), "ingest complete");

    state.ingest.finish(&desc.feed_id, t0.elapsed().as_millis() as u64);
    // Completion signal doubles as the frame hand-off.
    let _ = state.frames_tx.send(frames).await;
}

fn chunk_size(state: &Arc<AppState>) -> usize {
    let divisor = state.ingest.batch_divisor.load(Ordering::Relaxed).max(1);
    (BASE_CHUNK / divisor as usize).max(16)
}

async fn persist_run(state: &Arc<AppState>, run: &FeedRun) {
    let ok = write_with_retry(state, || async {
        state.store.insert_feed_run(run).await.map(|_| ())
    })
    .await;
    if ok {
        let _ = state.frames_tx.send(Vec::new()).await;
    }
}

/// One retry for transient store failures; persistent failures get a batch
/// id in the log and flip the backpressure flag.
async fn write_with_retry<F, Fut>(state: &Arc<AppState>, op: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    match op().await {
        Ok(()) => true,
        Err(e) if e.is_transient() => match op().await {
            Ok(()) => true,
            Err(e) => {
                let batch_id = Uuid::new_v4();
                error!(%batch_id, "store write failed after retry: {}", e);
                state.ingest.backpressure.store(true, Ordering::Relaxed);
                false
            }
        },
        Err(e) => {
            let batch_id = Uuid::new_v4();
            error!(%batch_id, "store write failed: {}", e);
            false
        }
    }
}

// ── Detection ─────────────────────────────────────────────────

pub async fn run_detection_loop(
    state: Arc<AppState>,
    mut frames_rx: mpsc::Receiver<Vec<FrameVector>>,
    mut trigger_rx: mpsc::Receiver<()>,
) {
    info!("detection loop started");
    loop {
        let mut pending: Vec<FrameVector> = Vec::new();

        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            Some(frames) = frames_rx.recv() => pending.extend(frames),
            Some(()) = trigger_rx.recv() => {
                info!("operator-triggered detection tick");
            }
        }

        // Coalesce completions that land within one second.
        let deadline = tokio::time::sleep(DETECTION_COALESCE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                more = frames_rx.recv() => match more {
                    Some(frames) => pending.extend(frames),
                    None => break,
                },
            }
        }

        run_detection_tick(&state, pending).await;
    }
    info!("detection loop stopped");
}

async fn run_detection_tick(state: &Arc<AppState>, frames: Vec<FrameVector>) {
    state.ingest.detection_runs.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now();

    state.detector.observe_tick(&frames);
    let mut outcome = state.detector.score_frames(&frames, now);
    if outcome.model_cold {
        debug!("outlier model cold; frames not scored");
    }

    let sequences = state.detector.score_sequences(now);
    if sequences.model_cold {
        debug!("sequence model cold");
    }
    outcome.decisions.extend(sequences.decisions);

    for decision in outcome.decisions {
        match decision {
            ScoreDecision::Insert(anomaly) => {
                // Publish only after the row is durable.
                match state.store.insert_anomaly(&anomaly).await {
                    Ok(()) => {
                        let delivered = state.bus.publish(Arc::new(anomaly));
                        debug!(subscribers = delivered, "anomaly published");
                    }
                    Err(StoreError::DuplicateAnomaly(id)) => {
                        debug!(%id, "anomaly already stored");
                    }
                    Err(e) => {
                        error!("anomaly insert failed, not publishing: {}", e);
                    }
                }
            }
            ScoreDecision::Raise {
                anomaly_id,
                severity,
            } => {
                if let Err(e) = state.store.raise_anomaly_severity(anomaly_id, severity).await {
                    error!(%anomaly_id, "severity raise failed: {}", e);
                }
            }
        }
    }
}


// ── Retention ─────────────────────────────────────────────────

pub async fn run_purge_loop(state: Arc<AppState>) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        let horizon = Utc::now() - chrono::Duration::hours(state.config.store.retention_hours as i64);
        match state.store.purge_before(horizon).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "retention purge"),
            Err(e) => warn!("retention purge failed: {}", e),
        }
    }
}

// ── Nightly retrain ───────────────────────────────────────────

pub async fn run_retrain_loop(state: Arc<AppState>) {
    let expr = format!("0 0 {} * * *", state.config.detector.retrain_hour_utc % 24);
    let schedule = match cron::Schedule::from_str(&expr) {
        Ok(s) => s,
        Err(e) => {
            error!("invalid retrain schedule '{}': {}", expr, e);
            return;
        }
    };

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!("next retrain at {}", next);

        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                training::train_all(state.clone()).await;
            }
        }
    }
}
