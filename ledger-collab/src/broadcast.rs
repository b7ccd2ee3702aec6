//! Per-room fan-out of encoded events.
//!
//! One tokio broadcast channel per room. Every connection that joined the
//! room holds a receiver; each frame carries an [`Audience`] so targeted
//! events (trade offers) ride the same channel and are filtered on the
//! receiving side:
//!
//! ```text
//! Room actor ──publish──► [ Arc<Outbound> ] ──► conn A  (Room ✓)
//!                                           ├─► conn B  (Connection(B) ✓)
//!                                           └─► conn C  (Connection(B) ✗)
//! ```
//!
//! Frames are encoded once and shared behind an `Arc`. A receiver that
//! falls more than `capacity` frames behind skips ahead; the server then
//! sends that connection the full room state so it converges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Who a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every connection subscribed to the room
    Room,
    /// A single connection
    Connection(Uuid),
}

/// An encoded frame plus its audience.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Audience,
    pub bytes: Vec<u8>,
}

impl Outbound {
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        match self.audience {
            Audience::Room => true,
            Audience::Connection(target) => target == connection_id,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel of one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may lag before it starts
    /// skipping.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.sender.subscribe()
    }

    /// Encode and send. Returns the number of receivers reached.
    pub fn publish(&self, audience: Audience, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.publish_raw(Arc::new(Outbound { audience, bytes })))
    }

    /// Send a pre-encoded frame.
    pub fn publish_raw(&self, frame: Arc<Outbound>) -> usize {
        // An error only means nobody is subscribed right now.
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
