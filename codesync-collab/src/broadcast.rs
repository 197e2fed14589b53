//! Per-connection outbound queues and fan-out.
//!
//! Every connection owns one bounded queue. The relay only ever enqueues
//! with `try_send`, so a slow or dead consumer never blocks the sender or
//! the other connections of the session. A per-connection writer task
//! drains the queue onto the socket.
//!
//! ```text
//!              ┌──► Outbox(A) ──► writer task ──► socket A
//! relay ───────┼──► Outbox(B) ──► writer task ──► socket B
//!  (try_send)  └──► Outbox(C) ──► writer task ──► socket C
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::ServerMessage;

/// Messages are shared between all recipients of one fan-out.
pub type Outbound = Arc<ServerMessage>;

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Lock-free delivery counters shared by every outbox of a registry.
#[derive(Debug, Default)]
pub struct AtomicDeliveryStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicDeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: Uuid,
    sender: mpsc::Sender<Outbound>,
    stats: Arc<AtomicDeliveryStats>,
}

impl Outbox {
    /// Create a queue for one connection.
    ///
    /// `capacity` is the number of messages buffered before further
    /// fire-and-forget deliveries to this connection are dropped.
    pub fn channel(
        connection_id: Uuid,
        capacity: usize,
        stats: Arc<AtomicDeliveryStats>,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                connection_id,
                sender,
                stats,
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Enqueue without waiting. Fails if the queue is full or closed.
    pub fn deliver(&self, msg: Outbound) -> Result<(), CollabError> {
        match self.sender.try_send(msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "outbound queue full",
                    mpsc::error::TrySendError::Closed(_) => "connection closed",
                };
                Err(CollabError::TransientDelivery {
                    connection_id: self.connection_id,
                    reason: reason.to_string(),
                })
            }
        }
    }

    /// Enqueue a direct reply, waiting for queue space.
    ///
    /// Only used for responses to this connection's own requests, so the
    /// wait never holds up anyone else.
    pub async fn send(&self, msg: ServerMessage) -> Result<(), CollabError> {
        self.sender.send(Arc::new(msg)).await.map_err(|_| {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            CollabError::TransientDelivery {
                connection_id: self.connection_id,
                reason: "connection closed".to_string(),
            }
        })?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Deliver one message to every outbox yielded by `targets`.
///
/// Failures are logged and swallowed. Returns the number of successful
/// enqueues.
pub fn fan_out<'a>(targets: impl IntoIterator<Item = &'a Outbox>, msg: &Outbound) -> usize {
    let mut delivered = 0;
    for outbox in targets {
        match outbox.deliver(msg.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => log::warn!("Dropped delivery: {e}"),
        }
    }
    delivered
}
