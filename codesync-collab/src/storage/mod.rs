//! Durable version history.
//!
//! ```text
//! ┌─────────────┐  save / list / get   ┌───────────────┐
//! │ SyncServer  │ ───────────────────► │ SnapshotStore │
//! │ (sessions)  │ ◄─────────────────── │ (RocksDB)     │
//! └─────────────┘   files / diffs      └───────┬───────┘
//!                                              │ column families
//!                          ┌───────────────────┴──────────────────┐
//!                          │ CF "versions" — records (LZ4)         │
//!                          │ CF "sessions" — per-session index     │
//!                          │ CF "meta"     — save sequence         │
//!                          └──────────────────────────────────────┘
//! ```
//!
//! The store never reads or writes live session state. Restoring a
//! version only returns its files.

pub mod rocks;

pub use rocks::{NewVersion, SnapshotStore, StoreConfig, StoreError, Version, VersionDiff};
