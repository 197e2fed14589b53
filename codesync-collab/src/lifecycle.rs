//! Connection lifecycle: attach with full replay, and detach.
//!
//! ```text
//!            attach(s)                 attach(t), t != s
//! UNATTACHED ─────────► ATTACHED(s) ───────────────────► ATTACHED(t)
//!     ▲                     │          (implicit detach from s)
//!     └──── detach ─────────┘
//! ```
//!
//! Replay happens while the session lock is held, so no edit can slip in
//! between the joiner registering and receiving the current files. The
//! replay is a single non-blocking enqueue, so a joiner that stopped reading
//! cannot hold the lock.

use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::{Outbound, Outbox};
use crate::directory::{OpenDirectory, SessionDirectory};
use crate::error::CollabError;
use crate::protocol::ServerMessage;
use crate::registry::{LockedSession, Member, Session, SessionRegistry};

/// Attachment state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unattached,
    Attached { session_id: String },
}

/// One live client connection.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    outbox: Outbox,
    user_id: Option<String>,
    session: Option<Arc<Session>>,
}

impl Connection {
    /// Open a new, unattached connection and its outbound queue.
    pub fn open(registry: &SessionRegistry) -> (Self, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (outbox, rx) = registry.open_outbox(id);
        (
            Self {
                id,
                outbox,
                user_id: None,
                session: None,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn state(&self) -> ConnectionState {
        match &self.session {
            Some(session) => ConnectionState::Attached {
                session_id: session.id().to_string(),
            },
            None => ConnectionState::Unattached,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }
}

/// Attaches and detaches connections against the registry.
pub struct LifecycleManager {
    registry: Arc<SessionRegistry>,
    directory: Arc<dyn SessionDirectory>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<SessionRegistry>, directory: Arc<dyn SessionDirectory>) -> Self {
        Self {
            registry,
            directory,
        }
    }

    /// Manager that accepts every session id.
    pub fn open(registry: Arc<SessionRegistry>) -> Self {
        Self::new(registry, Arc::new(OpenDirectory))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Attach `conn` to `session_id` and replay the session's files to it.
    ///
    /// The joiner receives one `Attached` message holding every current
    /// file. Nobody else is notified. Attaching again to the same session
    /// replays again.
    ///
    /// The replay is enqueued without waiting. If the joiner's queue has no
    /// room, the attach is undone and `TransientDelivery` is returned; the
    /// client can attach again once it has caught up.
    pub async fn attach(
        &self,
        conn: &mut Connection,
        session_id: &str,
        user_id: Option<String>,
    ) -> Result<(), CollabError> {
        if !self.directory.session_exists(session_id).await {
            return Err(CollabError::SessionNotFound(session_id.to_string()));
        }

        if conn.session_id().is_some_and(|current| current != session_id) {
            self.detach(conn).await;
        }

        let display_name = match &user_id {
            Some(uid) => self.directory.display_name(uid).await,
            None => None,
        };

        let mut locked = self.registry.lock_live(session_id).await;
        if let Err(e) = replay(&conn.outbox, &locked, display_name) {
            log::warn!("Replay to {} failed, attach to {session_id} undone: {e}", conn.id);
            locked.remove_member(conn.id);
            conn.session = None;
            if locked.member_count() == 0 {
                self.registry.stop_autosave(&mut locked);
                self.registry.evict_if_idle(locked).await;
            }
            return Err(e);
        }

        locked.add_member(Member {
            outbox: conn.outbox.clone(),
            user_id: user_id.clone(),
        });
        self.registry.ensure_autosave(&mut locked);

        conn.session = Some(locked.session().clone());
        conn.user_id = user_id;

        log::info!(
            "Connection {} attached to session {session_id} ({} members, {} files)",
            conn.id,
            locked.member_count(),
            locked.files().len()
        );
        Ok(())
    }

    /// Detach `conn` from its session. Returns whether it was attached.
    ///
    /// Never fails. Safe to call twice, on a never-attached connection, or
    /// after the session has been evicted.
    pub async fn detach(&self, conn: &mut Connection) -> bool {
        let Some(session) = conn.session.take() else {
            return false;
        };

        let mut locked = LockedSession::acquire(session).await;
        let removed = locked.remove_member(conn.id).is_some();
        let remaining = locked.member_count();
        log::info!(
            "Connection {} detached from session {} ({remaining} members left)",
            conn.id,
            locked.id()
        );

        if remaining == 0 {
            self.registry.stop_autosave(&mut locked);
            self.registry.evict_if_idle(locked).await;
        }
        removed
    }
}

/// Enqueue the joiner's replay. Runs under the session lock, so it never waits.
fn replay(
    outbox: &Outbox,
    locked: &LockedSession,
    display_name: Option<String>,
) -> Result<(), CollabError> {
    outbox.deliver(Arc::new(ServerMessage::Attached {
        session_id: locked.id().to_string(),
        connection_id: outbox.connection_id(),
        display_name,
        files: locked.files().to_records(),
    }))
}
