use thiserror::Error;

/// Per-message handling errors for the data updater critical path.
///
/// The taxonomy splits in two: payload violations, where the device sent
/// something we refuse to store, and infrastructure errors, where the plant
/// itself failed. The former discard the message and ask the device for a
/// clean session; the latter abort the actor so the tracker requeues all
/// unacked messages.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("invalid path: {path}")]
    InvalidPath { path: String },
    #[error("no mapping found for {interface}{path}")]
    MappingNotFound { interface: String, path: String },
    #[error("ambiguous endpoint guess for {interface}{path}")]
    GuessedEndpoints { interface: String, path: String },
    #[error("cannot write on server owned interface {interface}")]
    CannotWriteOnServerOwnedInterface { interface: String },
    #[error("failed to load interface {interface}")]
    InterfaceLoadingFailed { interface: String },
    #[error("undecodable BSON payload on {interface}{path}")]
    UndecodableBsonPayload { interface: String, path: String },
    #[error("unexpected value type on {interface}{path}: expected {expected}")]
    UnexpectedValueType {
        interface: String,
        path: String,
        expected: String,
    },
    #[error("unexpected object key {key} on {interface}{path}")]
    UnexpectedObjectKey {
        interface: String,
        path: String,
        key: String,
    },
    #[error("value size exceeded on {interface}{path}: {size} bytes")]
    ValueSizeExceeded {
        interface: String,
        path: String,
        size: usize,
    },
    #[error("invalid introspection payload")]
    InvalidIntrospection,
    #[error("invalid properties control payload")]
    InvalidProperties,
    #[error("database error: {0}")]
    DatabaseError(#[from] crate::storage::StorageError),
    #[error("failed to publish trigger event: {0}")]
    EventPublishFailed(String),
}

impl MessageError {
    /// True for device-caused violations that discard the message and ask a
    /// clean session; false for infrastructure errors that abort the actor
    /// and requeue.
    pub fn is_payload_violation(&self) -> bool {
        !matches!(
            self,
            MessageError::DatabaseError(_) | MessageError::EventPublishFailed(_)
        )
    }

    /// Stable snake_case tag used in `msg_handling_error` log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageError::InvalidPath { .. } => "invalid_path",
            MessageError::MappingNotFound { .. } => "mapping_not_found",
            MessageError::GuessedEndpoints { .. } => "guessed_endpoints",
            MessageError::CannotWriteOnServerOwnedInterface { .. } => {
                "cannot_write_on_server_owned_interface"
            }
            MessageError::InterfaceLoadingFailed { .. } => "interface_loading_failed",
            MessageError::UndecodableBsonPayload { .. } => "undecodable_bson_payload",
            MessageError::UnexpectedValueType { .. } => "unexpected_value_type",
            MessageError::UnexpectedObjectKey { .. } => "unexpected_object_key",
            MessageError::ValueSizeExceeded { .. } => "value_size_exceeded",
            MessageError::InvalidIntrospection => "invalid_introspection",
            MessageError::InvalidProperties => "invalid_properties",
            MessageError::DatabaseError(_) => "database_error",
            MessageError::EventPublishFailed(_) => "event_publish_failed",
        }
    }
}
