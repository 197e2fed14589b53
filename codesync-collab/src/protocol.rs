//! Wire protocol between editors and the sync server.
//!
//! Every WebSocket frame carries exactly one message. Two encodings are
//! accepted on the same socket:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ Binary frame │ bincode (standard config) — native clients   │
//! │ Text frame   │ JSON, externally tagged — browser clients    │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The server answers in whichever encoding the client used last.

use codesync_core::{FileRecord, VersionFile};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionResult;
use crate::storage::{Version, VersionDiff};

/// Frame encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

/// Messages sent by an editor to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a session. Replaces any previous attachment of this connection.
    Attach {
        session_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    /// Leave the current session without closing the socket.
    Detach,
    /// Replace the whole file-set of a session.
    Edit {
        session_id: String,
        files: Vec<FileRecord>,
    },
    /// Insert or replace a single file.
    FileChange {
        session_id: String,
        file: FileRecord,
    },
    /// Run code in the execution sandbox; the result goes to the whole session.
    Execute {
        session_id: String,
        source: String,
        language: String,
    },
    SaveVersion {
        session_id: String,
        files: Vec<VersionFile>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        author_id: Option<String>,
        #[serde(default)]
        audio_ref: Option<String>,
    },
    ListVersions {
        session_id: String,
    },
    RestoreVersion {
        version_id: Uuid,
    },
    DiffVersions {
        from: Uuid,
        to: Uuid,
    },
    Ping,
}

/// Error classes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Execution,
    Protocol,
    Storage,
    Unavailable,
}

/// Messages sent by the server to an editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Attach acknowledged, carrying the session's current files.
    Attached {
        session_id: String,
        connection_id: Uuid,
        display_name: Option<String>,
        files: Vec<FileRecord>,
    },
    Detached {
        session_id: String,
    },
    /// A single-file change made by another connection.
    FileUpdate {
        session_id: String,
        file: FileRecord,
    },
    /// The complete file-set after another connection's edit.
    FilesReplaced {
        session_id: String,
        files: Vec<FileRecord>,
    },
    ExecutionResult {
        session_id: String,
        result: ExecutionResult,
    },
    VersionSaved {
        version: Version,
    },
    VersionList {
        session_id: String,
        versions: Vec<Version>,
    },
    VersionRestored {
        version_id: Uuid,
        files: Vec<VersionFile>,
    },
    VersionDiff {
        diff: VersionDiff,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

fn encode_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_bincode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bincode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_bincode(bytes)
    }

    pub fn encode_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn decode_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Attach { .. } => "attach",
            ClientMessage::Detach => "detach",
            ClientMessage::Edit { .. } => "edit",
            ClientMessage::FileChange { .. } => "file_change",
            ClientMessage::Execute { .. } => "execute",
            ClientMessage::SaveVersion { .. } => "save_version",
            ClientMessage::ListVersions { .. } => "list_versions",
            ClientMessage::RestoreVersion { .. } => "restore_version",
            ClientMessage::DiffVersions { .. } => "diff_versions",
            ClientMessage::Ping => "ping",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bincode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_bincode(bytes)
    }

    pub fn encode_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn decode_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
