//! HTTP fetcher with bounded retries and jittered exponential backoff.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::feeds::FeedDescriptor;

/// Hard cap on a feed payload; larger bodies fail with `SizeLimit`.
pub const MAX_FEED_BYTES: usize = 4 * 1024 * 1024;

/// Backoff starts here and doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Backoff never exceeds this.
const BACKOFF_CAP: Duration = Duration::from_secs(4);

pub struct Fetcher {
    http: reqwest::Client,
    max_retries: u32,
}

impl Fetcher {
    pub fn new(timeout: Duration, max_retries: u32) -> Result<Fetcher, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent("headway/0.1")
            .gzip(true)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Fetcher { http, max_retries })
    }

    /// Fetch one feed, retrying transport-class failures with backoff.
    ///
    /// Returns the raw body; recording the FeedRun is the caller's job so
    /// that fetch and decode outcomes land in one record.
    pub async fn fetch(&self, desc: &FeedDescriptor) -> Result<Bytes, FetchError> {
        let mut last_err = FetchError::Transport("no attempt made".into());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                debug!(feed = %desc.feed_id, attempt, "retrying after {:?}", delay);
                tokio::time::sleep(delay).await;
            }

            match self.attempt(desc).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() => {
                    warn!(feed = %desc.feed_id, attempt, "fetch failed: {}", e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    async fn attempt(&self, desc: &FeedDescriptor) -> Result<Bytes, FetchError> {
        let response = self
            .http
            .get(&desc.url)
            .timeout(desc.timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_FEED_BYTES {
                return Err(FetchError::SizeLimit(len as usize));
            }
        }

        let body = response.bytes().await.map_err(classify_reqwest_error)?;
        if body.len() > MAX_FEED_BYTES {
            return Err(FetchError::SizeLimit(body.len()));
        }
        Ok(body)
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        // Resolution and connect failures surface the same way.
        FetchError::Dns(e.to_string())
    } else {
        FetchError::Transport(e.to_string())
    }
}

/// Exponential backoff for the nth retry: 250ms * 2^(n-1), capped at 4s,
/// with ±20% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(6));
    let capped = exp.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    capped.mul_f64(jitter)
}
