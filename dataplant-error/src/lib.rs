pub mod message;
pub mod storage;

use anyhow::Error as AnyhowError;
use config::ConfigError;
use message::MessageError;
use std::io::Error as IoError;
use storage::StorageError;
use thiserror::Error;
use tokio::task::JoinError;

pub type DupResult<T, E = DupError> = Result<T, E>;
pub type StorageResult<T, E = StorageError> = Result<T, E>;

/// Top-level error for the data updater plant.
///
/// Component-specific errors (`StorageError`, `MessageError`) convert into
/// this type at crate boundaries; inside a component the specific type is
/// used directly.
#[derive(Error, Debug)]
pub enum DupError {
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("{0}")]
    StorageError(#[from] StorageError),
    #[error("{0}")]
    MessageError(#[from] MessageError),
    #[error("device actor is not running")]
    ActorUnavailable,
    #[error("message tracker failure")]
    MessageTrackerFailure,
    #[error("broker channel failure: {0}")]
    BrokerError(String),
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
    #[error("trigger not found: {0}")]
    TriggerNotFound(uuid::Uuid),
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),
}

impl From<String> for DupError {
    #[inline]
    fn from(e: String) -> Self {
        DupError::Msg(e)
    }
}

impl From<&str> for DupError {
    #[inline]
    fn from(e: &str) -> Self {
        DupError::Msg(e.to_string())
    }
}
