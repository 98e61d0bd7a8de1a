use thiserror::Error;

/// Errors produced while loading the static schedule bundle.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Neither stops.txt nor routes.txt could be found. Fatal at startup.
    #[error("schedule bundle missing at {0}: no stops.txt or routes.txt")]
    Missing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
