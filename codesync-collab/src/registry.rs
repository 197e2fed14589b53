//! Session registry: the live file-set and the attached connections of
//! every session.
//!
//! The registry map is only locked to look up or insert a session. All
//! reads and writes of one session go through that session's own mutex, so
//! activity in one session never waits on another.
//!
//! ```text
//! SessionRegistry
//!   └── RwLock<HashMap<session_id, Arc<Session>>>
//!          └── Session
//!                └── Mutex<SessionState>
//!                      ├── files    (FileSet, unique names)
//!                      ├── members  (attach order, one Outbox each)
//!                      └── autosave (task handle while members exist)
//! ```

use codesync_core::{FileRecord, FileSet};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::autosave::{spawn_autosave, AutosavePolicy};
use crate::broadcast::{AtomicDeliveryStats, DeliveryStats, Outbound, Outbox};
use crate::error::CollabError;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Messages buffered per connection before deliveries are dropped
    pub outbox_capacity: usize,
    /// Drop a session (and its live files) when its last connection leaves
    pub evict_idle: bool,
    /// Periodic autosave, if any
    pub autosave: Option<AutosavePolicy>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            evict_idle: false,
            autosave: None,
        }
    }
}

/// A connection attached to a session.
#[derive(Debug, Clone)]
pub struct Member {
    pub outbox: Outbox,
    pub user_id: Option<String>,
}

impl Member {
    pub fn connection_id(&self) -> Uuid {
        self.outbox.connection_id()
    }
}

/// Mutable state of one session, only reachable through its lock.
#[derive(Debug, Default)]
pub struct SessionState {
    files: FileSet,
    members: Vec<Member>,
    autosave: Option<crate::autosave::AutosaveHandle>,
    evicted: bool,
}

impl SessionState {
    pub fn files(&self) -> &FileSet {
        &self.files
    }

    /// Replace the whole file-set.
    pub fn replace_files(&mut self, files: FileSet) {
        self.files = files;
    }

    /// Insert or replace one file by name.
    pub fn upsert_file(&mut self, file: FileRecord) -> Option<FileRecord> {
        self.files.insert(file)
    }

    /// Add a member, replacing an existing entry for the same connection.
    pub fn add_member(&mut self, member: Member) {
        let id = member.connection_id();
        match self.members.iter_mut().find(|m| m.connection_id() == id) {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    pub fn remove_member(&mut self, connection_id: Uuid) -> Option<Member> {
        let index = self
            .members
            .iter()
            .position(|m| m.connection_id() == connection_id)?;
        Some(self.members.remove(index))
    }

    pub fn has_member(&self, connection_id: Uuid) -> bool {
        self.members.iter().any(|m| m.connection_id() == connection_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn outboxes(&self) -> impl Iterator<Item = &Outbox> {
        self.members.iter().map(|m| &m.outbox)
    }

    pub fn outboxes_except(&self, connection_id: Uuid) -> impl Iterator<Item = &Outbox> {
        self.outboxes()
            .filter(move |o| o.connection_id() != connection_id)
    }

    /// User id of the earliest attached member that supplied one.
    pub fn first_author(&self) -> Option<String> {
        self.members.iter().find_map(|m| m.user_id.clone())
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn autosave_running(&self) -> bool {
        self.autosave.is_some()
    }
}

/// One collaborative session.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }
}

/// A session together with its held lock.
pub struct LockedSession {
    session: Arc<Session>,
    state: OwnedMutexGuard<SessionState>,
}

impl LockedSession {
    pub(crate) async fn acquire(session: Arc<Session>) -> Self {
        let state = session.state.clone().lock_owned().await;
        Self { session, state }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }
}

impl Deref for LockedSession {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl DerefMut for LockedSession {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

/// Process-wide owner of all live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: RegistryConfig,
    stats: Arc<AtomicDeliveryStats>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            stats: Arc::new(AtomicDeliveryStats::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create the outbound queue for a new connection.
    pub fn open_outbox(&self, connection_id: Uuid) -> (Outbox, mpsc::Receiver<Outbound>) {
        Outbox::channel(connection_id, self.config.outbox_capacity, self.stats.clone())
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }

    /// Get or create the session for `session_id`.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(session_id) {
            return session.clone();
        }

        log::debug!("Creating session {session_id}");
        let session = Arc::new(Session::new(session_id.to_string()));
        sessions.insert(session_id.to_string(), session.clone());
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Lock a live session, creating it when absent.
    ///
    /// A session evicted between lookup and locking is skipped and a fresh
    /// one is created in its place.
    pub async fn lock_live(&self, session_id: &str) -> LockedSession {
        loop {
            let session = self.get_or_create(session_id).await;
            let locked = LockedSession::acquire(session).await;
            if !locked.is_evicted() {
                return locked;
            }
            let stale = locked.session.clone();
            drop(locked);
            self.remove_entry(&stale).await;
        }
    }

    /// Lock a session only if it already exists.
    pub async fn lock_existing(&self, session_id: &str) -> Option<LockedSession> {
        let session = self.get(session_id).await?;
        let locked = LockedSession::acquire(session).await;
        if locked.is_evicted() {
            return None;
        }
        Some(locked)
    }

    /// Replace a session's file-set, creating the session if needed.
    pub async fn replace_file_set(&self, session_id: &str, files: FileSet) {
        let mut locked = self.lock_live(session_id).await;
        locked.replace_files(files);
    }

    /// The current files of a session, ordered by name.
    pub async fn current_files(&self, session_id: &str) -> Result<Vec<FileRecord>, CollabError> {
        let locked = self
            .lock_existing(session_id)
            .await
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
        Ok(locked.files().to_records())
    }

    /// Number of attached connections; zero for unknown sessions.
    pub async fn connection_count(&self, session_id: &str) -> usize {
        match self.lock_existing(session_id).await {
            Some(locked) => locked.member_count(),
            None => 0,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Begin autosaving if configured and not already running.
    pub(crate) fn ensure_autosave(&self, locked: &mut LockedSession) {
        if locked.state.autosave.is_some() {
            return;
        }
        if let Some(policy) = &self.config.autosave {
            let handle = spawn_autosave(policy, &locked.session);
            locked.state.autosave = Some(handle);
        }
    }

    /// Cancel autosaving. Dropping the handle aborts the task.
    pub(crate) fn stop_autosave(&self, locked: &mut LockedSession) {
        if locked.state.autosave.take().is_some() {
            log::debug!("Autosave cancelled for session {}", locked.id());
        }
    }

    /// Drop an empty session when idle eviction is on. Consumes the lock.
    pub(crate) async fn evict_if_idle(&self, mut locked: LockedSession) -> bool {
        if !self.config.evict_idle || locked.member_count() > 0 {
            return false;
        }
        locked.state.evicted = true;
        locked.state.autosave = None;
        let session = locked.session.clone();
        drop(locked);
        self.remove_entry(&session).await;
        log::info!("Evicted idle session {}", session.id());
        true
    }

    /// Remove `session` from the map if it is still the registered instance.
    async fn remove_entry(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(session.id()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(session.id());
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SnapshotStore, StoreConfig};
    use std::time::Duration;

    fn member(registry: &SessionRegistry, user: Option<&str>) -> (Member, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = registry.open_outbox(Uuid::new_v4());
        (
            Member {
                outbox,
                user_id: user.map(str::to_string),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let registry = SessionRegistry::default();
        let a = registry.get_or_create("s1").await;
        let b = registry.get_or_create("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_replace_then_current_files() {
        let registry = SessionRegistry::default();
        let files = FileSet::from_records([
            FileRecord::new("b.py", "print(2)", "python"),
            FileRecord::new("a.js", "1", "javascript"),
        ]);
        registry.replace_file_set("s1", files).await;

        let current = registry.current_files("s1").await.unwrap();
        let names: Vec<&str> = current.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.js", "b.py"]);
    }

    #[tokio::test]
    async fn test_current_files_unknown_session() {
        let registry = SessionRegistry::default();
        assert!(matches!(
            registry.current_files("missing").await,
            Err(CollabError::SessionNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_replace_accepts_empty_set() {
        let registry = SessionRegistry::default();
        registry
            .replace_file_set("s1", FileSet::from_records([FileRecord::inferred("a.js", "x")]))
            .await;
        registry.replace_file_set("s1", FileSet::new()).await;
        assert!(registry.current_files("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_member_bookkeeping() {
        let registry = SessionRegistry::default();
        let (first, _rx1) = member(&registry, None);
        let (second, _rx2) = member(&registry, Some("bob"));
        let (third, _rx3) = member(&registry, Some("carol"));
        let first_id = first.connection_id();

        let mut locked = registry.lock_live("s1").await;
        locked.add_member(first.clone());
        locked.add_member(second);
        locked.add_member(third);
        locked.add_member(first);
        assert_eq!(locked.member_count(), 3);
        assert_eq!(locked.first_author().as_deref(), Some("bob"));
        assert_eq!(locked.outboxes_except(first_id).count(), 2);

        assert!(locked.remove_member(first_id).is_some());
        assert!(locked.remove_member(first_id).is_none());
        assert!(!locked.has_member(first_id));
    }

    #[tokio::test]
    async fn test_eviction_is_opt_in() {
        let registry = SessionRegistry::default();
        let locked = registry.lock_live("s1").await;
        assert!(!registry.evict_if_idle(locked).await);
        assert_eq!(registry.session_count().await, 1);

        let evicting = SessionRegistry::new(RegistryConfig {
            evict_idle: true,
            ..Default::default()
        });
        let mut locked = evicting.lock_live("s1").await;
        locked.upsert_file(FileRecord::inferred("a.js", "1"));
        assert!(evicting.evict_if_idle(locked).await);
        assert_eq!(evicting.session_count().await, 0);

        // A later lock starts from an empty file-set.
        let locked = evicting.lock_live("s1").await;
        assert!(locked.files().is_empty());
    }

    #[tokio::test]
    async fn test_lock_live_skips_evicted_session() {
        let registry = SessionRegistry::new(RegistryConfig {
            evict_idle: true,
            ..Default::default()
        });
        let stale = registry.get_or_create("s1").await;
        stale.lock().await.evicted = true;

        let locked = registry.lock_live("s1").await;
        assert!(!locked.is_evicted());
        assert!(!Arc::ptr_eq(locked.session(), &stale));
    }

    #[tokio::test]
    async fn test_autosave_saves_current_files() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let registry = SessionRegistry::new(RegistryConfig {
            autosave: Some(AutosavePolicy::new(store.clone(), Duration::from_millis(20))),
            ..Default::default()
        });
        let (alice, _rx) = member(&registry, Some("alice"));

        {
            let mut locked = registry.lock_live("s1").await;
            locked.upsert_file(FileRecord::inferred("main.py", "print(1)"));
            locked.add_member(alice);
            registry.ensure_autosave(&mut locked);
            assert!(locked.autosave_running());
        }

        tokio::time::sleep(Duration::from_millis(120)).await;

        let versions = store.list("s1").unwrap();
        assert!(!versions.is_empty());
        assert_eq!(versions[0].message, crate::autosave::AUTOSAVE_MESSAGE);
        assert_eq!(versions[0].saved_by.as_deref(), Some("alice"));

        {
            let mut locked = registry.lock_live("s1").await;
            registry.stop_autosave(&mut locked);
            assert!(!locked.autosave_running());
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = store.version_count("s1").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.version_count("s1").unwrap(), settled);
    }
}
