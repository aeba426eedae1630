use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Watch stream error: {0}")]
    WatchError(String),

    #[error("Storage backend error: {0}")]
    StorageError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
