//! User and session directory.
//!
//! The collaboration core does not own accounts or session records; it
//! asks a directory whether a session exists and what to call a user.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Whether connections may attach to `session_id`.
    async fn session_exists(&self, session_id: &str) -> bool;

    /// Display name for a user id, if known.
    async fn display_name(&self, user_id: &str) -> Option<String>;
}

/// Accepts every session and echoes user ids back as display names.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl SessionDirectory for OpenDirectory {
    async fn session_exists(&self, _session_id: &str) -> bool {
        true
    }

    async fn display_name(&self, user_id: &str) -> Option<String> {
        Some(user_id.to_string())
    }
}

/// Fixed in-memory directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    sessions: RwLock<HashSet<String>>,
    users: RwLock<HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.add_session(session_id);
        self
    }

    pub fn with_user(self, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.add_user(user_id, display_name);
        self
    }

    pub fn add_session(&self, session_id: impl Into<String>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session_id.into());
        }
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .map(|mut sessions| sessions.remove(session_id))
            .unwrap_or(false)
    }

    pub fn add_user(&self, user_id: impl Into<String>, display_name: impl Into<String>) {
        if let Ok(mut users) = self.users.write() {
            users.insert(user_id.into(), display_name.into());
        }
    }
}

#[async_trait]
impl SessionDirectory for StaticDirectory {
    async fn session_exists(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .map(|sessions| sessions.contains(session_id))
            .unwrap_or(false)
    }

    async fn display_name(&self, user_id: &str) -> Option<String> {
        self.users.read().ok()?.get(user_id).cloned()
    }
}
