//! Windowed running statistics (Welford with removal).

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Rolling mean/stdev over a time window with a hard sample cap.
/// Oldest entries are evicted first, by time then by count.
#[derive(Debug, Clone)]
pub struct RollingStats {
    window: Duration,
    cap: usize,
    samples: VecDeque<(DateTime<Utc>, f64)>,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            window,
            cap: cap.max(2),
            samples: VecDeque::new(),
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, value: f64) {
        self.evict(at);
        if self.samples.len() == self.cap {
            self.remove_oldest();
        }

        self.samples.push_back((at, value));
        let n = self.samples.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some((t, _)) = self.samples.front() {
            if now.signed_duration_since(*t) > self.window {
                self.remove_oldest();
            } else {
                break;
            }
        }
    }

    fn remove_oldest(&mut self) {
        let Some((_, value)) = self.samples.pop_front() else {
            return;
        };
        let n = self.samples.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let old_mean = self.mean;
        self.mean = (old_mean * (n as f64 + 1.0) - value) / n as f64;
        self.m2 -= (value - old_mean) * (value - self.mean);
        if self.m2 < 0.0 {
            self.m2 = 0.0; // float cancellation guard
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample standard deviation; 0 with fewer than two samples.
    pub fn stdev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        (self.m2 / (n as f64 - 1.0)).sqrt()
    }

    /// z-score of a value against the current window; 0 when the window has
    /// no variance yet.
    pub fn zscore(&self, value: f64) -> f64 {
        let sd = self.stdev();
        if sd <= f64::EPSILON {
            0.0
        } else {
            (value - self.mean()) / sd
        }
    }
}
