//! WebSocket sync server with session-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Outbox(A) ── writer ── Client A
//!            ├── reader ── dispatch ───┼── Outbox(B) ── writer ── Client B
//! Client B ──┘        │                └── Outbox(C) ── writer ── Client C
//!                     │
//!                     ├── SessionRegistry  (live files, members)
//!                     ├── ExecutionSandbox (spawned per run)
//!                     └── SnapshotStore    (RocksDB, optional)
//! ```
//!
//! Each connection runs one reader loop that decodes frames and dispatches
//! them, and one writer task that drains the connection's outbox onto the
//! socket. Errors are reported to the client and never end the session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::autosave::{AutosavePolicy, DEFAULT_AUTOSAVE_INTERVAL};
use crate::broadcast::Outbound;
use crate::directory::{OpenDirectory, SessionDirectory};
use crate::error::CollabError;
use crate::execution::{
    run_in_sandbox, ExecutionSandbox, LocalProcessSandbox, DEFAULT_EXEC_TIMEOUT,
};
use crate::lifecycle::{Connection, LifecycleManager};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};
use crate::registry::{RegistryConfig, SessionRegistry, DEFAULT_OUTBOX_CAPACITY};
use crate::relay::BroadcastRelay;
use crate::storage::{NewVersion, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbox_capacity: usize,
    /// Version history storage path (None = no history)
    pub storage_path: Option<PathBuf>,
    /// Autosave period (None = off; needs storage)
    pub autosave_interval: Option<Duration>,
    /// Drop sessions whose last connection left
    pub evict_idle: bool,
    /// Wall-clock limit for one code execution
    pub exec_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            storage_path: None,
            autosave_interval: Some(DEFAULT_AUTOSAVE_INTERVAL),
            evict_idle: false,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Read `CODESYNC_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let autosave_secs: u64 = parse_or(
            &lookup,
            "CODESYNC_AUTOSAVE_SECS",
            DEFAULT_AUTOSAVE_INTERVAL.as_secs(),
        );
        let exec_timeout_ms: u64 = parse_or(
            &lookup,
            "CODESYNC_EXEC_TIMEOUT_MS",
            defaults.exec_timeout.as_millis() as u64,
        );

        Self {
            bind_addr: lookup("CODESYNC_BIND_ADDR").unwrap_or(defaults.bind_addr),
            outbox_capacity: parse_or(&lookup, "CODESYNC_OUTBOX_CAPACITY", defaults.outbox_capacity)
                .max(1),
            storage_path: lookup("CODESYNC_DATA_DIR")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            autosave_interval: (autosave_secs > 0).then(|| Duration::from_secs(autosave_secs)),
            evict_idle: parse_or(&lookup, "CODESYNC_EVICT_IDLE", defaults.evict_idle),
            exec_timeout: Duration::from_millis(exec_timeout_ms),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring invalid {key}={raw:?}, using default");
                default
            }
        },
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub deliveries_sent: u64,
    pub deliveries_dropped: u64,
    pub versions_saved: u64,
}

/// Everything a connection task needs.
struct ServerContext {
    registry: Arc<SessionRegistry>,
    lifecycle: LifecycleManager,
    relay: BroadcastRelay,
    store: Option<Arc<SnapshotStore>>,
    sandbox: Arc<dyn ExecutionSandbox>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ServerContext {
    fn store(&self) -> Result<&SnapshotStore, CollabError> {
        self.store.as_deref().ok_or(CollabError::HistoryUnavailable)
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    directory: Arc<dyn SessionDirectory>,
    sandbox: Arc<dyn ExecutionSandbox>,
    /// Version history (optional)
    store: Option<Arc<SnapshotStore>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the version store if one is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(SnapshotStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };

        let autosave = match (&store, config.autosave_interval) {
            (Some(store), Some(interval)) => Some(AutosavePolicy::new(store.clone(), interval)),
            _ => None,
        };

        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            outbox_capacity: config.outbox_capacity,
            evict_idle: config.evict_idle,
            autosave,
        }));

        log::info!(
            "Sync server configured (history: {}, autosave: {:?}, evict idle: {})",
            store.is_some(),
            registry.config().autosave.as_ref().map(|p| p.interval),
            config.evict_idle
        );

        Ok(Self {
            sandbox: Arc::new(LocalProcessSandbox::new(config.exec_timeout)),
            directory: Arc::new(OpenDirectory),
            config,
            registry,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server with default settings.
    pub fn with_defaults() -> Self {
        Self::in_memory(ServerConfig::default())
    }

    /// Server without version history, whatever the config says.
    pub fn in_memory(config: ServerConfig) -> Self {
        let config = ServerConfig {
            storage_path: None,
            ..config
        };
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            outbox_capacity: config.outbox_capacity,
            evict_idle: config.evict_idle,
            autosave: None,
        }));
        Self {
            sandbox: Arc::new(LocalProcessSandbox::new(config.exec_timeout)),
            directory: Arc::new(OpenDirectory),
            config,
            registry,
            store: None,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create a server with version history at `path`.
    pub fn with_storage(
        bind_addr: &str,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.to_string(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    pub fn with_directory(mut self, directory: Arc<dyn SessionDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ExecutionSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    fn context(&self) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            registry: self.registry.clone(),
            lifecycle: LifecycleManager::new(self.registry.clone(), self.directory.clone()),
            relay: BroadcastRelay::new(self.registry.clone()),
            store: self.store.clone(),
            sandbox: self.sandbox.clone(),
            stats: self.stats.clone(),
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ctx = self.context();
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut conn, outbox_rx) = Connection::open(&ctx.registry);
        let (control_tx, control_rx) = mpsc::channel::<Message>(8);
        let json_mode = Arc::new(AtomicBool::new(false));
        log::info!("WebSocket connection {} established from {addr}", conn.id());

        let writer = tokio::spawn(Self::write_loop(
            ws_sender,
            outbox_rx,
            control_rx,
            json_mode.clone(),
        ));

        // Process incoming messages
        while let Some(frame) = ws_receiver.next().await {
            let decoded = match frame {
                Ok(Message::Binary(data)) => {
                    json_mode.store(false, Ordering::Relaxed);
                    Self::record_message(&ctx, data.len()).await;
                    ClientMessage::decode(&data)
                }
                Ok(Message::Text(text)) => {
                    json_mode.store(true, Ordering::Relaxed);
                    Self::record_message(&ctx, text.len()).await;
                    ClientMessage::decode_json(text.as_str())
                }
                Ok(Message::Ping(data)) => {
                    let _ = control_tx.send(Message::Pong(data)).await;
                    continue;
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            };

            match decoded {
                Ok(msg) => Self::dispatch(&ctx, &mut conn, msg).await,
                Err(e) => {
                    log::warn!("Failed to decode message from {addr}: {e}");
                    let _ = conn.outbox().send(CollabError::from(e).to_message()).await;
                }
            }
        }

        // Cleanup: leave the session, then let the writer flush and stop
        ctx.lifecycle.detach(&mut conn).await;
        drop(conn);
        drop(control_tx);
        if let Err(e) = writer.await {
            log::error!("Writer task for {addr} failed: {e}");
        }

        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        Ok(())
    }

    async fn record_message(ctx: &ServerContext, len: usize) {
        let mut s = ctx.stats.write().await;
        s.total_messages += 1;
        s.total_bytes += len as u64;
    }

    /// Drain a connection's outbox onto its socket.
    async fn write_loop(
        mut sink: WsSink,
        mut outbox_rx: mpsc::Receiver<Outbound>,
        mut control_rx: mpsc::Receiver<Message>,
        json_mode: Arc<AtomicBool>,
    ) {
        loop {
            let frame = tokio::select! {
                Some(frame) = control_rx.recv() => frame,
                msg = outbox_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let format = if json_mode.load(Ordering::Relaxed) {
                        WireFormat::Json
                    } else {
                        WireFormat::Binary
                    };
                    match encode_frame(&msg, format) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::error!("Failed to encode outbound message: {e}");
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = sink.send(frame).await {
                log::debug!("Socket write failed, stopping writer: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    }

    /// Route one client message. Failures are answered with an error message.
    async fn dispatch(ctx: &Arc<ServerContext>, conn: &mut Connection, msg: ClientMessage) {
        log::debug!("Connection {}: {}", conn.id(), msg.kind());
        if let Err(e) = Self::handle_message(ctx, conn, msg).await {
            log::debug!("Request from {} failed: {e}", conn.id());
            if let Err(send_err) = conn.outbox().send(e.to_message()).await {
                log::debug!("Could not report error: {send_err}");
            }
        }
    }

    async fn handle_message(
        ctx: &Arc<ServerContext>,
        conn: &mut Connection,
        msg: ClientMessage,
    ) -> Result<(), CollabError> {
        match msg {
            ClientMessage::Attach {
                session_id,
                user_id,
            } => ctx.lifecycle.attach(conn, &session_id, user_id).await,

            ClientMessage::Detach => {
                let session_id = conn.session_id().map(str::to_string);
                if ctx.lifecycle.detach(conn).await {
                    if let Some(session_id) = session_id {
                        conn.outbox()
                            .send(ServerMessage::Detached { session_id })
                            .await?;
                    }
                }
                Ok(())
            }

            ClientMessage::Edit { session_id, files } => {
                ensure_attached(conn, &session_id)?;
                ctx.relay.on_edit(&session_id, conn.id(), files).await;
                Ok(())
            }

            ClientMessage::FileChange { session_id, file } => {
                ensure_attached(conn, &session_id)?;
                ctx.relay.on_file_change(&session_id, conn.id(), file).await;
                Ok(())
            }

            ClientMessage::Execute {
                session_id,
                source,
                language,
            } => {
                // Runs off the reader loop; the result goes to the whole session.
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let result = run_in_sandbox(ctx.sandbox.as_ref(), &source, &language).await;
                    ctx.relay.on_execution_result(&session_id, result).await;
                });
                Ok(())
            }

            ClientMessage::SaveVersion {
                session_id,
                files,
                message,
                author_id,
                audio_ref,
            } => {
                let version = ctx.store()?.save(NewVersion {
                    session_id,
                    files,
                    message,
                    author: author_id,
                    audio_path: audio_ref,
                })?;
                ctx.stats.write().await.versions_saved += 1;
                conn.outbox()
                    .send(ServerMessage::VersionSaved { version })
                    .await
            }

            ClientMessage::ListVersions { session_id } => {
                let versions = ctx.store()?.list(&session_id)?;
                conn.outbox()
                    .send(ServerMessage::VersionList {
                        session_id,
                        versions,
                    })
                    .await
            }

            ClientMessage::RestoreVersion { version_id } => {
                let files = ctx.store()?.restore(version_id)?;
                conn.outbox()
                    .send(ServerMessage::VersionRestored { version_id, files })
                    .await
            }

            ClientMessage::DiffVersions { from, to } => {
                let diff = ctx.store()?.diff(from, to)?;
                conn.outbox().send(ServerMessage::VersionDiff { diff }).await
            }

            ClientMessage::Ping => conn.outbox().send(ServerMessage::Pong).await,
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let delivery = self.registry.delivery_stats();
        stats.deliveries_sent = delivery.messages_sent;
        stats.deliveries_dropped = delivery.messages_dropped;
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the version store (if configured).
    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }
}

fn encode_frame(msg: &ServerMessage, format: WireFormat) -> Result<Message, ProtocolError> {
    Ok(match format {
        WireFormat::Binary => Message::Binary(msg.encode()?.into()),
        WireFormat::Json => Message::Text(msg.encode_json()?.into()),
    })
}

/// Edits are only accepted for the session the connection is attached to.
fn ensure_attached(conn: &Connection, session_id: &str) -> Result<(), CollabError> {
    if conn.session_id() == Some(session_id) {
        Ok(())
    } else {
        Err(CollabError::NotAttached(session_id.to_string()))
    }
}
