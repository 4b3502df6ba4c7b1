use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that cross module boundaries.
///
/// Logical outcomes (insufficient history, whole-case violations, quota
/// rejections) live on the owning module's error enum; this type covers the
/// infrastructure failures that bubble to the process level.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: String },

    #[error("invalid document in {collection}/{id}: {reason}")]
    InvalidDocument {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage bucket not configured")]
    StorageBucketNotConfigured,
}
