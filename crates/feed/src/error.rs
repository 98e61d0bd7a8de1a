use thiserror::Error;

/// Failure modes of a single feed fetch (after retries are exhausted).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("DNS/connect error: {0}")]
    Dns(String),

    #[error("response exceeded size limit ({0} bytes)")]
    SizeLimit(usize),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// Transport-class failures are retried; HTTP 4xx and size caps are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Dns(_) | FetchError::Transport(_) => true,
            FetchError::Http(code) => *code >= 500,
            FetchError::SizeLimit(_) => false,
        }
    }
}

/// Failure modes of decoding one feed payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The envelope header itself could not be parsed; nothing was emitted.
    #[error("feed header unparseable: {0}")]
    Header(String),

    #[error("unsupported gtfs-realtime version: {0}")]
    Version(String),
}
