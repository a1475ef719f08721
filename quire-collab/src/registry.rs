//! Live room registry.
//!
//! Maps room keys to the room's shared state (merge engine plus broadcast
//! group). A room is opened lazily by the first session that needs it, seeded
//! from the update log, and evicted when its last [`RoomLease`] is dropped.
//!
//! ```text
//!   lease() ──► RoomEntry (sessions += 1) ──► room().await ──► open_room
//!                                                                │
//!       wait for previous drain ◄────────────────────────────────┤
//!       replay update log into a fresh MergeEngine ◄─────────────┤
//!       forward change stream ──► PersistenceWorker ◄────────────┘
//!
//!   last lease dropped ──► evict ──► drain: forwarder done + worker flush
//! ```
//!
//! The drain is registered under the same lock that evicts the entry, so a
//! room reopened right after eviction never replays a log that is missing
//! updates still queued by its previous instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::broadcast::BroadcastGroup;
use crate::engine::{MergeEngine, MergeError};
use crate::room::RoomKey;
use crate::storage::StoreError;
use crate::worker::PersistenceWorker;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("room loader failed: {0}")]
    Loader(String),
}

/// Shared state of one open room.
pub struct Room {
    key: RoomKey,
    engine: Arc<MergeEngine>,
    broadcast: BroadcastGroup,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }
}

struct RoomEntry {
    /// Outstanding leases. Only changed under the registry lock.
    sessions: AtomicUsize,
    room: OnceCell<Arc<Room>>,
}

type Drain = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<RoomKey, Arc<RoomEntry>>,
    /// Evicted rooms whose pending writes are still being flushed.
    drains: HashMap<RoomKey, (u64, Drain)>,
}

struct RegistryInner {
    worker: PersistenceWorker,
    broadcast_capacity: usize,
    state: Mutex<RegistryState>,
    generation: AtomicU64,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of live rooms. Cheap to clone.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    pub fn new(worker: PersistenceWorker, broadcast_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                worker,
                broadcast_capacity,
                state: Mutex::new(RegistryState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register interest in `key`. The room stays alive while the lease does.
    pub fn lease(&self, key: RoomKey) -> RoomLease {
        let mut state = self.inner.lock();
        let entry = state
            .rooms
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RoomEntry {
                    sessions: AtomicUsize::new(0),
                    room: OnceCell::new(),
                })
            })
            .clone();
        entry.sessions.fetch_add(1, Ordering::SeqCst);

        RoomLease {
            registry: self.inner.clone(),
            key,
            entry,
        }
    }

    /// Number of rooms with at least one lease.
    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// The open room for `key`, if loaded.
    pub fn get(&self, key: &RoomKey) -> Option<Arc<Room>> {
        let state = self.inner.lock();
        state.rooms.get(key).and_then(|entry| entry.room.get().cloned())
    }

    /// Number of leases held on `key`.
    pub fn session_count(&self, key: &RoomKey) -> usize {
        let state = self.inner.lock();
        state
            .rooms
            .get(key)
            .map_or(0, |entry| entry.sessions.load(Ordering::SeqCst))
    }

    pub fn worker(&self) -> &PersistenceWorker {
        &self.inner.worker
    }

    /// Wait until every evicted room has flushed its pending writes.
    pub async fn drained(&self) {
        let drains: Vec<Drain> = self
            .inner
            .lock()
            .drains
            .values()
            .map(|(_, drain)| drain.clone())
            .collect();
        for drain in drains {
            drain.await;
        }
    }

    /// Stop persisting live rooms and wait until everything they queued is written.
    ///
    /// Rooms stay open for their sessions; edits made afterwards are not persisted.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self
            .inner
            .lock()
            .rooms
            .values()
            .filter_map(|entry| entry.room.get().cloned())
            .collect();

        for room in &rooms {
            room.engine.close_changes();
            let forwarder = room
                .forwarder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(forwarder) = forwarder {
                let _ = forwarder.await;
            }
        }
        self.drained().await;
        self.inner.worker.flush().await;
        log::info!("Persisted pending updates of {} live rooms", rooms.len());
    }
}

/// A session's hold on a room.
pub struct RoomLease {
    registry: Arc<RegistryInner>,
    key: RoomKey,
    entry: Arc<RoomEntry>,
}

impl RoomLease {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// The room, opening it from the update log on first use.
    ///
    /// Concurrent callers share one load. The load runs on its own task, so a
    /// caller that stops waiting does not cancel it and the next caller gets
    /// its result instead of replaying the log again.
    pub async fn room(&self) -> Result<Arc<Room>, RegistryError> {
        if let Some(room) = self.entry.room.get() {
            return Ok(room.clone());
        }

        let entry = self.entry.clone();
        let registry = self.registry.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            entry
                .room
                .get_or_try_init(|| open_room(registry, key))
                .await
                .cloned()
        })
        .await
        .map_err(|e| RegistryError::Loader(e.to_string()))?
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        if self.entry.sessions.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        if state
            .rooms
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.entry))
        {
            state.rooms.remove(&self.key);
        }

        let Some(room) = self.entry.room.get() else {
            return;
        };
        room.engine.close_changes();
        let forwarder = room
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let worker = self.registry.worker.clone();
        let key = self.key.clone();
        let drain: Drain = async move {
            if let Some(forwarder) = forwarder {
                let _ = forwarder.await;
            }
            worker.flush().await;
            log::debug!("Room {key} drained");
        }
        .boxed()
        .shared();

        let generation = self.registry.generation.fetch_add(1, Ordering::SeqCst);
        state
            .drains
            .insert(self.key.clone(), (generation, drain.clone()));
        drop(state);
        log::debug!("Evicted room {}", self.key);

        match Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                let key = self.key.clone();
                handle.spawn(async move {
                    drain.await;
                    let mut state = registry.lock();
                    if state
                        .drains
                        .get(&key)
                        .is_some_and(|(current, _)| *current == generation)
                    {
                        state.drains.remove(&key);
                    }
                });
            }
            // The next open of this room drives the drain itself.
            Err(_) => log::warn!("No runtime to drain room {}", self.key),
        }
    }
}

async fn open_room(registry: Arc<RegistryInner>, key: RoomKey) -> Result<Arc<Room>, RegistryError> {
    let pending = registry.lock().drains.get(&key).map(|(_, d)| d.clone());
    if let Some(drain) = pending {
        drain.await;
    }

    let store = registry.worker.store().clone();
    let load_key = key.clone();
    let records = tokio::task::spawn_blocking(move || store.read_all(&load_key))
        .await
        .map_err(|e| RegistryError::Loader(e.to_string()))??;

    let engine = Arc::new(MergeEngine::new()?);
    let mut skipped = 0;
    for record in &records {
        if let Err(e) = engine.apply(&record.update) {
            skipped += 1;
            log::warn!("Skipping record #{} of {key}: {e}", record.sequence);
        }
    }
    log::info!(
        "Opened room {key} from {} records ({skipped} skipped)",
        records.len()
    );

    // Subscribe after replay: persisted history is not written again.
    let mut changes = engine.observe_changes();
    let worker = registry.worker.clone();
    let forward_key = key.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(delta) = changes.next().await {
            worker.enqueue(&forward_key, delta);
        }
    });

    Ok(Arc::new(Room {
        key,
        engine,
        broadcast: BroadcastGroup::new(registry.broadcast_capacity),
        forwarder: Mutex::new(Some(forwarder)),
    }))
}
