//! # codesync-core — shared data model and diff engine
//!
//! Everything in this crate is pure: no I/O, no locks, no async. The
//! collaboration layer (`codesync-collab`) builds the live session state
//! and the version history on top of these types.
//!
//! - [`FileRecord`] / [`FileSet`] — the live, editable file-set of a session
//! - [`VersionFile`] — the `(name, content)` pair captured in a snapshot
//! - [`diff`] — line-level diffs between two snapshots plus a summary label

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod diff;

pub use diff::{diff_file_sets, diff_lines, summarize, ChangeSummary, DiffPart, DiffTag, FileDiff};

/// A single file in a session's live file-set.
///
/// The language tag is display metadata only and is never checked
/// against the content.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub content: String,
    pub language: String,
}

impl FileRecord {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            language: language.into(),
        }
    }

    /// Build a record whose language tag is inferred from the file extension.
    pub fn inferred(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let language = language_for_name(&name).to_string();
        Self {
            name,
            content: content.into(),
            language,
        }
    }

    /// Strip the record down to what a snapshot stores.
    pub fn to_version_file(&self) -> VersionFile {
        VersionFile {
            name: self.name.clone(),
            content: self.content.clone(),
        }
    }
}

/// A file as captured by a snapshot: name and content, no language tag.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct VersionFile {
    pub name: String,
    pub content: String,
}

impl VersionFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// The live file-set of a session, keyed by file name.
///
/// Names are unique: inserting a record with an existing name replaces it.
/// Iteration order is by name so replays are deterministic.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct FileSet {
    files: BTreeMap<String, FileRecord>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a file-set from records. Later records win on duplicate names.
    pub fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let mut set = Self::new();
        for record in records {
            set.insert(record);
        }
        set
    }

    /// Rebuild a live file-set from snapshot files, inferring language tags.
    pub fn from_version_files(files: &[VersionFile]) -> Self {
        Self::from_records(
            files
                .iter()
                .map(|f| FileRecord::inferred(f.name.clone(), f.content.clone())),
        )
    }

    /// Insert or replace a file. Returns the previous record, if any.
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.files.insert(record.name.clone(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<FileRecord> {
        self.files.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.files.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn to_records(&self) -> Vec<FileRecord> {
        self.files.values().cloned().collect()
    }

    pub fn to_version_files(&self) -> Vec<VersionFile> {
        self.files.values().map(FileRecord::to_version_file).collect()
    }

    /// Whether this file-set holds exactly the given snapshot files
    /// (compared by name and content, ignoring language tags).
    pub fn matches_version_files(&self, files: &[VersionFile]) -> bool {
        let other = Self::from_version_files(files);
        self.len() == other.len()
            && self
                .iter()
                .all(|f| other.get(&f.name).is_some_and(|o| o.content == f.content))
    }
}

impl FromIterator<FileRecord> for FileSet {
    fn from_iter<T: IntoIterator<Item = FileRecord>>(iter: T) -> Self {
        Self::from_records(iter)
    }
}

/// Rejection reasons for a snapshot file list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("a version must contain at least one file")]
    EmptyFileList,
    #[error("file at index {index} has an empty name")]
    MissingName { index: usize },
}

/// Check a snapshot file list before it is stored.
///
/// Content may be empty; names may not.
pub fn validate_version_files(files: &[VersionFile]) -> Result<(), ValidationError> {
    if files.is_empty() {
        return Err(ValidationError::EmptyFileList);
    }
    for (index, file) in files.iter().enumerate() {
        if file.name.trim().is_empty() {
            return Err(ValidationError::MissingName { index });
        }
    }
    Ok(())
}

/// Display language tag for a file name, by extension.
pub fn language_for_name(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "plaintext",
    };
    match ext.as_str() {
        "js" | "mjs" | "cjs" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "py" => "python",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "java" => "java",
        "go" => "go",
        "php" => "php",
        "rb" => "ruby",
        "rs" => "rust",
        "html" | "htm" => "html",
        "css" => "css",
        "json" => "json",
        "md" => "markdown",
        _ => "plaintext",
    }
}
