use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("duplicate anomaly id: {0}")]
    DuplicateAnomaly(uuid::Uuid),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Transient failures worth a single retry at the write path.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Database(e)) => {
                // SQLite busy/locked surface as database errors.
                let msg = e.message().to_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            StoreError::Db(sqlx::Error::PoolTimedOut) => true,
            StoreError::Db(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}
