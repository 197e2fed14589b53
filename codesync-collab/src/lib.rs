//! # codesync-collab — Real-time collaboration backend for CodeSync
//!
//! Keeps the live file-set of every session, relays edits between the
//! editors attached to it, runs code on request and stores named versions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  bincode or JSON    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                  ┌─────────────────┬───────┴────────┬─────────────────┐
//!                  ▼                 ▼                ▼                 ▼
//!          LifecycleManager   BroadcastRelay   ExecutionSandbox   SnapshotStore
//!          (attach/detach)    (fan-out)        (node/python)      (RocksDB)
//!                  │                 │
//!                  └──► SessionRegistry ◄──┘
//!                       (per-session lock)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire messages (bincode binary frames, JSON text frames)
//! - [`registry`] — Live sessions, members and file-sets
//! - [`lifecycle`] — Attach with replay, idempotent detach
//! - [`relay`] — Edit and execution-result fan-out
//! - [`broadcast`] — Bounded per-connection outboxes
//! - [`autosave`] — Periodic background versions
//! - [`execution`] — Code execution sandbox
//! - [`directory`] — Session and user lookup
//! - [`storage`] — Version history (RocksDB + LZ4)
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod autosave;
pub mod broadcast;
pub mod client;
pub mod directory;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use autosave::{AutosaveHandle, AutosavePolicy};
pub use broadcast::{DeliveryStats, Outbox};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use directory::{OpenDirectory, SessionDirectory, StaticDirectory};
pub use error::CollabError;
pub use execution::{
    run_in_sandbox, ExecutionError, ExecutionResult, ExecutionSandbox, LocalProcessSandbox,
};
pub use lifecycle::{Connection, LifecycleManager};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage, WireFormat};
pub use registry::{RegistryConfig, Session, SessionRegistry};
pub use relay::BroadcastRelay;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{NewVersion, SnapshotStore, StoreConfig, StoreError, Version, VersionDiff};
