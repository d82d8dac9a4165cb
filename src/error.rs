//! Error taxonomy for the backup engine and its storage layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqobaError {
    /// Unknown game or backup id, or no save data where some was required.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Per-backup manifest is missing, unparsable, or has an unsupported
    /// schema version.
    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("compression error: {0}")]
    Compression(String),

    /// A backup or restore is already in flight for this game.
    #[error("operation already in progress for game {0}")]
    Busy(String),

    #[error("{0}")]
    Other(String),
}

impl From<zip::result::ZipError> for SqobaError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => SqobaError::Io(io),
            other => SqobaError::Compression(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SqobaError {
    fn from(err: serde_json::Error) -> Self {
        SqobaError::ManifestCorrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SqobaError>;
