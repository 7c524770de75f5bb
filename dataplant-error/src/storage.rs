use thiserror::Error;

/// Errors surfaced by the logical queries layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Database(String),
    #[error("device not found: {device}")]
    DeviceNotFound { device: String },
    #[error("interface not found: {interface} v{major}")]
    InterfaceNotFound { interface: String, major: i32 },
    #[error("serialization error: {0}")]
    Serialization(String),
}
