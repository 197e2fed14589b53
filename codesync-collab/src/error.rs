//! Error taxonomy for the collaboration core.
//!
//! Nothing here is fatal to the process. Validation and lookup failures are
//! reported back to the requesting client, delivery failures are logged and
//! swallowed by the relay, and execution failures are folded into a normal
//! result payload before they ever reach this type.

use codesync_core::ValidationError;
use uuid::Uuid;

use crate::execution::ExecutionError;
use crate::protocol::{ErrorKind, ProtocolError, ServerMessage};
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("connection is not attached to session {0}")]
    NotAttached(String),

    #[error("version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("delivery to connection {connection_id} failed: {reason}")]
    TransientDelivery { connection_id: Uuid, reason: String },

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("version history is not configured on this server")]
    HistoryUnavailable,
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CollabError::VersionNotFound(id),
            StoreError::Validation(v) => CollabError::Validation(v),
            other => CollabError::Storage(other),
        }
    }
}

impl CollabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::Validation(_) => ErrorKind::Validation,
            CollabError::SessionNotFound(_)
            | CollabError::NotAttached(_)
            | CollabError::VersionNotFound(_) => ErrorKind::NotFound,
            CollabError::TransientDelivery { .. } | CollabError::HistoryUnavailable => {
                ErrorKind::Unavailable
            }
            CollabError::Execution(_) => ErrorKind::Execution,
            CollabError::Storage(_) => ErrorKind::Storage,
            CollabError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// The message a client sees for this error.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.kind(), self.to_string())
    }
}
