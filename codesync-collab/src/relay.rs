//! Broadcast relay: write edits into the registry and fan them out.
//!
//! An edit's registry write and its fan-out happen under one session
//! lock, so siblings see edits of a session in the order they were
//! applied. Whole-file-set edits are last-writer-wins.

use codesync_core::{FileRecord, FileSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::fan_out;
use crate::execution::ExecutionResult;
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;

pub struct BroadcastRelay {
    registry: Arc<SessionRegistry>,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Replace the session's file-set and send it to every other member.
    ///
    /// Creates the session if absent. Returns the number of deliveries.
    pub async fn on_edit(
        &self,
        session_id: &str,
        originator: Uuid,
        files: Vec<FileRecord>,
    ) -> usize {
        let mut locked = self.registry.lock_live(session_id).await;
        locked.replace_files(FileSet::from_records(files));

        let msg = Arc::new(ServerMessage::FilesReplaced {
            session_id: session_id.to_string(),
            files: locked.files().to_records(),
        });
        let delivered = fan_out(locked.outboxes_except(originator), &msg);
        log::debug!(
            "Edit from {originator} in session {session_id}: {} files, {delivered} deliveries",
            locked.files().len()
        );
        delivered
    }

    /// Upsert one file and send just that file to every other member.
    pub async fn on_file_change(
        &self,
        session_id: &str,
        originator: Uuid,
        file: FileRecord,
    ) -> usize {
        let mut locked = self.registry.lock_live(session_id).await;
        locked.upsert_file(file.clone());

        let msg = Arc::new(ServerMessage::FileUpdate {
            session_id: session_id.to_string(),
            file,
        });
        let delivered = fan_out(locked.outboxes_except(originator), &msg);
        log::debug!("File change from {originator} in session {session_id}: {delivered} deliveries");
        delivered
    }

    /// Send an execution result to every member, requester included.
    ///
    /// Results for unknown sessions are dropped.
    pub async fn on_execution_result(&self, session_id: &str, result: ExecutionResult) -> usize {
        let Some(locked) = self.registry.lock_existing(session_id).await else {
            log::debug!("Dropping execution result for unknown session {session_id}");
            return 0;
        };

        let msg = Arc::new(ServerMessage::ExecutionResult {
            session_id: session_id.to_string(),
            result,
        });
        fan_out(locked.outboxes(), &msg)
    }
}
