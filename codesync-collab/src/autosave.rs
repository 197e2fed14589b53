//! Periodic background saves of live sessions.
//!
//! One task per session, started when the session gains its first
//! connection and aborted when the last one leaves. The task only holds a
//! weak reference, so it never keeps a session alive on its own.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::registry::Session;
use crate::storage::{NewVersion, SnapshotStore};

pub const AUTOSAVE_MESSAGE: &str = "Auto-save";

/// Default autosave period.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Where and how often to autosave.
#[derive(Clone)]
pub struct AutosavePolicy {
    pub store: Arc<SnapshotStore>,
    pub interval: Duration,
}

impl AutosavePolicy {
    pub fn new(store: Arc<SnapshotStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

impl std::fmt::Debug for AutosavePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutosavePolicy")
            .field("store", &self.store.path())
            .field("interval", &self.interval)
            .finish()
    }
}

/// Running autosave task. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct AutosaveHandle {
    task: JoinHandle<()>,
}

impl AutosaveHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start autosaving `session` under `policy`.
pub fn spawn_autosave(policy: &AutosavePolicy, session: &Arc<Session>) -> AutosaveHandle {
    let store = policy.store.clone();
    let period = policy.interval.max(Duration::from_millis(1));
    let weak = Arc::downgrade(session);
    let session_id = session.id().to_string();

    log::debug!("Autosave started for session {session_id} every {period:?}");

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !autosave_once(&weak, &store).await {
                break;
            }
        }
        log::debug!("Autosave stopped for session {session_id}");
    });

    AutosaveHandle { task }
}

/// Save one autosave version. Returns `false` once the session is gone.
async fn autosave_once(session: &Weak<Session>, store: &Arc<SnapshotStore>) -> bool {
    let Some(session) = session.upgrade() else {
        return false;
    };

    let request = {
        let state = session.lock().await;
        if state.is_evicted() {
            return false;
        }
        if state.files().is_empty() {
            log::trace!("Skipping autosave of empty session {}", session.id());
            return true;
        }
        NewVersion {
            session_id: session.id().to_string(),
            files: state.files().to_version_files(),
            message: AUTOSAVE_MESSAGE.to_string(),
            author: state.first_author(),
            audio_path: None,
        }
    };

    // RocksDB writes sync to disk; keep them off the async workers.
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.save(request)).await {
        Ok(Ok(version)) => log::info!("Auto-saved session {} as {}", session.id(), version.id),
        Ok(Err(e)) => log::error!("Auto-save of session {} failed: {e}", session.id()),
        Err(e) => log::error!("Auto-save task for session {} failed: {e}", session.id()),
    }
    true
}
