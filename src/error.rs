// Error taxonomy shared by every component.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlobError>;

#[derive(Error, Debug)]
pub enum BlobError {
    /// Caller supplied unusable input (e.g. an empty URL list).
    #[error("{0}")]
    Input(String),

    /// A single network attempt failed.
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Every configured path failed.
    #[error("{0}")]
    Exhausted(String),

    /// Missing/corrupt chunks or a hash mismatch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A probe or backend could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("no commitment for content={content_id} blob={blob_hash} custodian={custodian_id}")]
    UnknownCommitment {
        content_id: String,
        blob_hash: String,
        custodian_id: String,
    },

    #[error("invalid commitment transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<sled::Error> for BlobError {
    fn from(e: sled::Error) -> Self {
        BlobError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for BlobError {
    fn from(e: serde_json::Error) -> Self {
        BlobError::Store(format!("serialization: {}", e))
    }
}
