//! Update log compaction.
//!
//! Folds a room's whole history into one full-state update and swaps it in
//! atomically. Safe to run while the room is live: merging is commutative and
//! idempotent, so replacing history with its fold cannot change the outcome of
//! any later merge, and updates appended after the fold was read keep their
//! place behind the snapshot.

use std::sync::Arc;

use thiserror::Error;

use crate::engine::{fold_updates, MergeError};
use crate::room::RoomKey;
use crate::storage::{StoreError, UpdateLogStore};

#[derive(Error, Debug)]
pub enum CompactError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("room {room} has an update that cannot be merged: {source}")]
    Merge {
        room: String,
        #[source]
        source: MergeError,
    },
}

/// Compacts update logs in a shared store.
#[derive(Clone)]
pub struct Compactor {
    store: Arc<UpdateLogStore>,
}

impl Compactor {
    pub fn new(store: Arc<UpdateLogStore>) -> Self {
        Self { store }
    }

    /// Fold every record of `room` into one snapshot record.
    ///
    /// Returns `false` without touching the store when the room has no records.
    /// A record that cannot be merged fails the whole room and leaves its log as is.
    pub fn compact_one(&self, room: &RoomKey) -> Result<bool, CompactError> {
        let records = self.store.read_all(room)?;
        if records.is_empty() {
            return Ok(false);
        }

        let bytes_before: usize = records.iter().map(|r| r.update.len()).sum();
        let snapshot = fold_updates(records.iter().map(|r| r.update.as_slice())).map_err(
            |source| CompactError::Merge {
                room: room.to_string(),
                source,
            },
        )?;
        let folded: Vec<u64> = records.iter().map(|r| r.sequence).collect();

        self.store.replace_all(room, &folded, &snapshot)?;

        log::info!(
            "Compacted {room}: {} records / {bytes_before} bytes -> 1 record / {} bytes",
            folded.len(),
            snapshot.len()
        );
        Ok(true)
    }

    /// Compact every room in the store. Returns how many rooms were compacted.
    ///
    /// A room that fails is logged and skipped.
    pub fn compact_all(&self) -> Result<usize, CompactError> {
        let mut compacted = 0;
        for room in self.store.room_keys()? {
            match self.compact_one(&room) {
                Ok(true) => compacted += 1,
                Ok(false) => {}
                Err(e) => log::error!("Compaction failed for {room}: {e}"),
            }
        }
        Ok(compacted)
    }
}
