//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed requests for every client message
//! - An event stream of server messages
//!
//! There is no offline queue: after a reconnect, attaching again replays
//! the session's current files.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use codesync_core::{FileRecord, VersionFile};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Any message from the server
    Message(ServerMessage),
}

/// The sync client.
pub struct SyncClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Frame encoding for outgoing messages
    format: WireFormat,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a client that speaks bincode binary frames.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            format: WireFormat::Binary,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Use JSON text frames instead.
    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let decoded = match frame {
                    Ok(Message::Binary(data)) => ServerMessage::decode(&data),
                    Ok(Message::Text(text)) => ServerMessage::decode_json(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(msg) => {
                        if event_tx.send(SyncEvent::Message(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to decode server message: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. The writer task closes the socket.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Encode and send one message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let frame = match self.format {
            WireFormat::Binary => Message::Binary(msg.encode()?.into()),
            WireFormat::Json => Message::Text(msg.encode_json()?.into()),
        };
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn attach(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Attach {
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
        })
        .await
    }

    pub async fn detach(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Detach).await
    }

    /// Replace the whole file-set of a session.
    pub async fn edit(&self, session_id: &str, files: Vec<FileRecord>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Edit {
            session_id: session_id.to_string(),
            files,
        })
        .await
    }

    pub async fn change_file(&self, session_id: &str, file: FileRecord) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::FileChange {
            session_id: session_id.to_string(),
            file,
        })
        .await
    }

    pub async fn execute(
        &self,
        session_id: &str,
        source: &str,
        language: &str,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Execute {
            session_id: session_id.to_string(),
            source: source.to_string(),
            language: language.to_string(),
        })
        .await
    }

    pub async fn save_version(
        &self,
        session_id: &str,
        files: Vec<VersionFile>,
        message: &str,
        author_id: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SaveVersion {
            session_id: session_id.to_string(),
            files,
            message: message.to_string(),
            author_id: author_id.map(str::to_string),
            audio_ref: None,
        })
        .await
    }

    pub async fn list_versions(&self, session_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ListVersions {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn restore_version(&self, version_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::RestoreVersion { version_id }).await
    }

    pub async fn diff_versions(&self, from: Uuid, to: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::DiffVersions { from, to }).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
