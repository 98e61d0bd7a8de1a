//! Shared application state threaded through handlers and background loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use headway_catalog::Catalog;
use headway_compute::{Detector, FeatureEngine, FrameVector};
use headway_core::Config;
use headway_store::StateStore;

use crate::bus::AnomalyBus;

pub struct AppState {
    pub config: Config,
    /// Read-only after load; no lock needed.
    pub catalog: Arc<Catalog>,
    pub store: Arc<StateStore>,
    /// Sliding windows; single writer (the ingest loop), short critical
    /// sections, no await inside.
    pub engine: Mutex<FeatureEngine>,
    pub detector: Arc<Detector>,
    pub bus: AnomalyBus,
    pub ingest: IngestMetrics,
    /// Frames produced by ingest, consumed by the detection loop.
    pub frames_tx: mpsc::Sender<Vec<FrameVector>>,
    /// Operator-initiated one-shot detection ticks.
    pub detect_trigger: mpsc::Sender<()>,
    /// Root of the structured-cancellation tree.
    pub shutdown: CancellationToken,
}

/// Lock-free counters for ingest observability and backpressure.
///
/// All loads/stores use `Ordering::Relaxed` — monotonic counters where
/// eventual visibility is acceptable for status reads.
#[derive(Default)]
pub struct IngestMetrics {
    pub runs_ok: AtomicU64,
    pub runs_failed: AtomicU64,
    pub ticks: AtomicU64,
    pub overlap_skips: AtomicU64,
    pub shedding: AtomicU64,
    pub training_failed: AtomicU64,
    pub detection_runs: AtomicU64,
    /// Current position-insert chunk divisor (1 = full batches).
    pub batch_divisor: AtomicU32,
    /// True while the write path is over the high watermark.
    pub backpressure: AtomicBool,
    /// Epoch seconds of the last completed ingest tick.
    pub last_tick_at: AtomicI64,
    /// Per-feed fetch duration (ms), used to pick shedding victims.
    pub feed_durations: Mutex<HashMap<String, u64>>,
    /// Feeds with a fetch currently in flight; an overlapping tick skips them.
    pub in_flight: Mutex<std::collections::HashSet<String>>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        let m = IngestMetrics::default();
        m.batch_divisor.store(1, Ordering::Relaxed);
        m
    }

    /// Mark a feed in flight; false when a fetch is already running.
    pub fn try_begin(&self, feed_id: &str) -> bool {
        self.in_flight.lock().unwrap().insert(feed_id.to_string())
    }

    pub fn finish(&self, feed_id: &str, duration_ms: u64) {
        self.in_flight.lock().unwrap().remove(feed_id);
        self.feed_durations
            .lock()
            .unwrap()
            .insert(feed_id.to_string(), duration_ms);
    }

    /// The slower half of feeds, candidates for decode shedding.
    pub fn slowest_feeds(&self) -> std::collections::HashSet<String> {
        let durations = self.feed_durations.lock().unwrap();
        if durations.len() < 2 {
            return Default::default();
        }
        let mut ranked: Vec<(&String, &u64)> = durations.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));
        ranked
            .iter()
            .take(ranked.len() / 2)
            .map(|(id, _)| (*id).clone())
            .collect()
    }
}
