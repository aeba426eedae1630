use gantry_core::metadata::MetadataError;
use gantry_core::wire::CodecError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GantryError>;

#[derive(Debug, Error)]
pub enum GantryError {
    #[error("fleet not started: no broker attached within {0:?}")]
    NotStarted(Duration),

    #[error("message distribution is stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no broker available")]
    NoBrokerAvailable,

    #[error("broker {0} still owns destinations")]
    BrokerInUse(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("lock not acquired within timeout: {0}")]
    LockTimeout(String),

    #[error("collaborator call failed: {0}")]
    Collaborator(String),

    #[error("executor rejected task: {0}")]
    ExecutorRejected(String),

    #[error("metadata store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GantryError {
    /// Failures that only skip the current unit of work and are retried next poll cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GantryError::Transport(_)
                | GantryError::Collaborator(_)
                | GantryError::LockTimeout(_)
                | GantryError::MigrationFailed(_)
                | GantryError::NoBrokerAvailable
                | GantryError::BrokerInUse(_)
                | GantryError::Io(_)
        )
    }
}
