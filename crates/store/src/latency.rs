//! Write-latency tracking for backpressure decisions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How far back samples count toward the percentile.
const SAMPLE_WINDOW: Duration = Duration::from_secs(60);

/// Rolling p95 of store write latencies over the last minute.
///
/// Lock contention is negligible: one sample per write batch, a handful of
/// batches per tick.
#[derive(Debug, Default)]
pub struct WriteLatency {
    samples: Mutex<VecDeque<(Instant, Duration)>>,
}

impl WriteLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        samples.push_back((now, elapsed));
        while let Some((t, _)) = samples.front() {
            if now.duration_since(*t) > SAMPLE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// p95 over the window; zero when no samples.
    pub fn p95(&self) -> Duration {
        let samples = self.samples.lock().unwrap();
        let now = Instant::now();
        let mut live: Vec<Duration> = samples
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= SAMPLE_WINDOW)
            .map(|(_, d)| *d)
            .collect();
        if live.is_empty() {
            return Duration::ZERO;
        }
        live.sort();
        let idx = ((live.len() as f64) * 0.95).ceil() as usize;
        live[idx.saturating_sub(1).min(live.len() - 1)]
    }
}
