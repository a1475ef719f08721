//! Write-behind persistence.
//!
//! ```text
//!   enqueue(room, update) ──► unbounded FIFO ──► consumer thread ──► RoomLog::append
//!   flush()               ──►      (same queue)       └─► resolves the barrier
//! ```
//!
//! One queue, one consumer, strictly FIFO: updates of a room are written in
//! submission order. The consumer runs on a dedicated OS thread started on the
//! first enqueue and stops once every handle to the worker is gone and the
//! queue is drained.
//!
//! A failing write is retried `max_attempts` times with linear backoff, then
//! logged and dropped. A panic inside a job is caught; the loop keeps going.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::compactor::Compactor;
use crate::room::RoomKey;
use crate::storage::rocks::now_millis;
use crate::storage::{RoomLog, StoreError, UpdateLogStore};

/// Persistence worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Attempts per write before the job is dropped (at least 1).
    pub max_attempts: u32,
    /// Backoff unit between attempts; attempt `n` waits `n` units.
    pub retry_backoff_ms: u64,
    /// Squash a room's log before appending when its newest record is older
    /// than this. `None` disables squashing.
    pub document_ttl_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 25,
            document_ttl_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 2,
            retry_backoff_ms: 1,
            document_ttl_secs: None,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub enqueued: u64,
    pub written: u64,
    pub failed: u64,
    pub squashed: u64,
}

#[derive(Default)]
struct AtomicWorkerStats {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    squashed: AtomicU64,
}

/// Final step of a write job.
pub(crate) trait Appender: Send + Sync + 'static {
    fn append(&self, log: &RoomLog, update: &[u8]) -> Result<u64, StoreError>;
}

/// Appends straight to the store with empty metadata.
struct StoreAppender;

impl Appender for StoreAppender {
    fn append(&self, log: &RoomLog, update: &[u8]) -> Result<u64, StoreError> {
        log.append(update, &[])
    }
}

enum Job {
    Write { room: RoomKey, update: Vec<u8> },
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence worker. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    store: Arc<UpdateLogStore>,
    config: WorkerConfig,
    stats: Arc<AtomicWorkerStats>,
    appender: Arc<dyn Appender>,
    sender: OnceLock<mpsc::UnboundedSender<Job>>,
}

impl PersistenceWorker {
    pub fn new(store: Arc<UpdateLogStore>, config: WorkerConfig) -> Self {
        Self::with_appender(store, config, Arc::new(StoreAppender))
    }

    pub(crate) fn with_appender(
        store: Arc<UpdateLogStore>,
        config: WorkerConfig,
        appender: Arc<dyn Appender>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                config,
                stats: Arc::default(),
                appender,
                sender: OnceLock::new(),
            }),
        }
    }

    /// Queue `update` for `room`. Never blocks and never fails the caller.
    pub fn enqueue(&self, room: &RoomKey, update: Vec<u8>) {
        self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        let job = Job::Write {
            room: room.clone(),
            update,
        };
        if self.sender().send(job).is_err() {
            self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("Persistence worker is not running; dropped update for {room}");
        }
    }

    /// Resolves once every job enqueued before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender().send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let stats = &self.inner.stats;
        WorkerStats {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            written: stats.written.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            squashed: stats.squashed.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &Arc<UpdateLogStore> {
        &self.inner.store
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Job> {
        self.inner.sender.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let consumer = Consumer {
                compactor: Compactor::new(self.inner.store.clone()),
                store: self.inner.store.clone(),
                config: self.inner.config.clone(),
                stats: self.inner.stats.clone(),
                appender: self.inner.appender.clone(),
                logs: HashMap::new(),
            };
            let spawned = thread::Builder::new()
                .name("quire-persistence".into())
                .spawn(move || consumer.run(rx));
            if let Err(e) = spawned {
                // The receiver is gone with the closure; every send now fails and is logged.
                log::error!("Failed to start persistence worker: {e}");
            }
            tx
        })
    }
}

/// State owned by the consumer thread.
struct Consumer {
    store: Arc<UpdateLogStore>,
    compactor: Compactor,
    config: WorkerConfig,
    stats: Arc<AtomicWorkerStats>,
    appender: Arc<dyn Appender>,
    /// One log handle per room, kept for the worker's lifetime.
    logs: HashMap<RoomKey, RoomLog>,
}

impl Consumer {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        log::debug!("Persistence worker started");
        while let Some(job) = rx.blocking_recv() {
            match job {
                Job::Flush(done) => {
                    let _ = done.send(());
                }
                Job::Write { room, update } => {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| self.write(&room, &update)));
                    match outcome {
                        Ok(Ok(sequence)) => {
                            self.stats.written.fetch_add(1, Ordering::Relaxed);
                            log::trace!(
                                "Persisted update #{sequence} for {room} ({} bytes)",
                                update.len()
                            );
                        }
                        Ok(Err(e)) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Dropping update for {room} after {} attempts: {e}",
                                self.config.max_attempts.max(1)
                            );
                        }
                        Err(_) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            log::error!("Persistence job for {room} panicked; update dropped");
                        }
                    }
                }
            }
        }
        log::debug!("Persistence worker stopped");
    }

    fn write(&mut self, room: &RoomKey, update: &[u8]) -> Result<u64, StoreError> {
        let room_log = self
            .logs
            .entry(room.clone())
            .or_insert_with(|| RoomLog::new(self.store.clone(), room.clone()))
            .clone();

        if self.is_expired(&room_log) {
            match self.compactor.compact_one(room) {
                Ok(true) => {
                    self.stats.squashed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(e) => log::warn!("Could not squash expired history of {room}: {e}"),
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.appender.append(&room_log, update) {
                Ok(sequence) => return Ok(sequence),
                Err(e) if attempt < max_attempts => {
                    log::warn!("Write for {room} failed (attempt {attempt}/{max_attempts}): {e}");
                    thread::sleep(self.config.backoff(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_expired(&self, room_log: &RoomLog) -> bool {
        let Some(ttl_secs) = self.config.document_ttl_secs else {
            return false;
        };
        match room_log.newest_timestamp() {
            Ok(Some(newest)) => {
                now_millis().saturating_sub(newest) >= ttl_secs.saturating_mul(1000)
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("Could not read newest record of {}: {e}", room_log.room());
                false
            }
        }
    }
}
