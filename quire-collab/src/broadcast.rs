//! Per-room fan-out of raw frames to every joined session.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, each of
//! which buffers up to `capacity` frames. A session that falls further behind
//! observes `Lagged` and is resynchronized by the gateway with a full-state
//! update instead of replaying what it missed.
//!
//! Frames carry their origin session so a receiver can skip its own echoes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A frame as relayed within a room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    /// Session that produced the frame.
    pub origin: Uuid,
    /// Exact bytes received from the origin.
    pub payload: Arc<Vec<u8>>,
}

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub active_members: usize,
}

struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,

    /// Joined sessions and the user behind each.
    members: RwLock<HashMap<Uuid, String>>,

    capacity: usize,

    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per member.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats {
                frames_sent: AtomicU64::new(0),
                frames_lagged: AtomicU64::new(0),
            },
        }
    }

    /// Join a session. Frames sent after this call are delivered to the receiver.
    pub async fn add_member(
        &self,
        session_id: Uuid,
        user: impl Into<String>,
    ) -> broadcast::Receiver<RoomFrame> {
        let mut members = self.members.write().await;
        members.insert(session_id, user.into());
        self.sender.subscribe()
    }

    /// Leave. Returns the user name if the session was a member.
    pub async fn remove_member(&self, session_id: &Uuid) -> Option<String> {
        self.members.write().await.remove(session_id)
    }

    /// Relay `payload` to every member, the origin included.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast_from(&self, origin: Uuid, payload: Arc<Vec<u8>>) -> usize {
        let count = self
            .sender
            .send(RoomFrame { origin, payload })
            .unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a member skipped `missed` frames.
    pub fn record_lag(&self, missed: u64) {
        self.stats.frames_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, session_id: &Uuid) -> bool {
        self.members.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
