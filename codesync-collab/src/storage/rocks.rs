//! RocksDB-backed snapshot (version) store.
//!
//! Column families:
//! - `versions` — Version records, bincode + LZ4, keyed by version UUID
//! - `sessions` — per-session index, `<len:4><session_id><sequence:8 BE>` → version UUID
//! - `meta`     — store-wide counters (the global save sequence)
//!
//! Versions are append-only: the store never rewrites or deletes them.
//! Listing walks the session index, which sorts by save sequence, and
//! returns newest first.

use codesync_core::{diff_file_sets, summarize, validate_version_files, ChangeSummary, FileDiff};
use codesync_core::{ValidationError, VersionFile};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

/// Column family names.
const CF_VERSIONS: &str = "versions";
const CF_SESSIONS: &str = "sessions";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_VERSIONS, CF_SESSIONS, CF_META];

const SEQUENCE_KEY: &[u8] = b"sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true — versions are rare and precious)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codesync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// An immutable, saved copy of a session's file-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub session_id: String,
    pub files: Vec<VersionFile>,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub saved_at: u64,
    /// Authoring user; `None` for auto-saves
    pub saved_by: Option<String>,
    /// Path of an audio annotation in the attachment store
    pub audio_path: Option<String>,
    /// Store-wide save order
    pub sequence: u64,
}

impl Version {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (version, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(version)
    }
}

/// A request to save a version.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
    pub session_id: String,
    pub files: Vec<VersionFile>,
    pub message: String,
    pub author: Option<String>,
    pub audio_path: Option<String>,
}

/// Per-file diffs between two versions plus a summary label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from: Uuid,
    pub to: Uuid,
    pub files: Vec<FileDiff>,
    pub summary: ChangeSummary,
}

impl VersionDiff {
    pub fn added_lines(&self) -> usize {
        self.files.iter().map(FileDiff::added_lines).sum()
    }

    pub fn removed_lines(&self) -> usize {
        self.files.iter().map(FileDiff::removed_lines).sum()
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Version not found
    NotFound(Uuid),
    /// Rejected save request
    Validation(ValidationError),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Version not found: {id}"),
            StoreError::Validation(e) => write!(f, "Invalid version: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        StoreError::Validation(e)
    }
}

/// RocksDB-backed version store.
pub struct SnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Next save sequence number; held for the whole save so the
    /// persisted counter never goes backwards
    sequence: Mutex<u64>,
}

impl SnapshotStore {
    /// Open the store at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened snapshot store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: Mutex::new(sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_VERSIONS => {
                // Values are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SESSIONS => {
                // Small keys, range-scanned per session
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, SEQUENCE_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(_) => Err(StoreError::DeserializationError(
                "Corrupt sequence counter".into(),
            )),
            None => Ok(0),
        }
    }

    // ─── Versions ─────────────────────────────────────────────────────

    /// Validate and durably append a version.
    ///
    /// The version record, the session index entry and the sequence
    /// counter are written in one atomic batch.
    pub fn save(&self, request: NewVersion) -> Result<Version, StoreError> {
        validate_version_files(&request.files)?;

        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut next = self
            .sequence
            .lock()
            .map_err(|_| StoreError::DatabaseError("Sequence lock poisoned".into()))?;
        let sequence = *next;
        let version = Version {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            files: request.files,
            message: request.message,
            saved_at: now_millis(),
            saved_by: request.author,
            audio_path: request.audio_path,
            sequence,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_versions, version.id.as_bytes(), version.encode()?);
        batch.put_cf(
            &cf_sessions,
            Self::index_key(&version.session_id, sequence),
            version.id.as_bytes(),
        );
        batch.put_cf(&cf_meta, SEQUENCE_KEY, (sequence + 1).to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        *next = sequence + 1;
        drop(next);

        log::info!(
            "Saved version {} for session {} ({} files)",
            version.id,
            version.session_id,
            version.files.len()
        );
        Ok(version)
    }

    /// Load a version by id.
    pub fn get(&self, version_id: Uuid) -> Result<Version, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, version_id.as_bytes())? {
            Some(bytes) => Version::decode(&bytes),
            None => Err(StoreError::NotFound(version_id)),
        }
    }

    /// All versions of a session, newest first.
    pub fn list(&self, session_id: &str) -> Result<Vec<Version>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let prefix = Self::index_prefix(session_id);
        let start_key = Self::index_key(session_id, 0);

        let mut ids = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let id = Uuid::from_slice(&value)
                .map_err(|_| StoreError::DeserializationError("Invalid UUID in index".into()))?;
            ids.push(id);
        }

        ids.iter().rev().map(|id| self.get(*id)).collect()
    }

    /// The stored file list of a version, unmodified.
    ///
    /// Live session state is untouched; the caller pushes the files back
    /// through an edit.
    pub fn restore(&self, version_id: Uuid) -> Result<Vec<VersionFile>, StoreError> {
        Ok(self.get(version_id)?.files)
    }

    /// Diff two versions (`from` → `to`) and summarize the change.
    pub fn diff(&self, from: Uuid, to: Uuid) -> Result<VersionDiff, StoreError> {
        let a = self.get(from)?;
        let b = self.get(to)?;
        let files = diff_file_sets(&a.files, &b.files);
        let summary = summarize(&files);
        Ok(VersionDiff {
            from,
            to,
            files,
            summary,
        })
    }

    /// Number of versions saved for a session.
    pub fn version_count(&self, session_id: &str) -> Result<usize, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let prefix = Self::index_prefix(session_id);
        let start_key = Self::index_key(session_id, 0);

        let mut count = 0;
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// The next sequence number to be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.lock().map(|next| *next).unwrap_or_default()
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Length-prefixed session id, so one id is never a prefix of another's keys.
    fn index_prefix(session_id: &str) -> Vec<u8> {
        let bytes = session_id.as_bytes();
        let mut prefix = Vec::with_capacity(4 + bytes.len());
        prefix.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        prefix.extend_from_slice(bytes);
        prefix
    }

    fn index_key(session_id: &str, sequence: u64) -> Vec<u8> {
        let mut key = Self::index_prefix(session_id);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
