//! Durable update log: the source of truth for every room.
//!
//! ```text
//! ┌──────────────────┐  enqueue   ┌───────────────────┐  append   ┌────────────────┐
//! │ MergeEngine      │ ─────────► │ PersistenceWorker │ ────────► │ UpdateLogStore │
//! │ (change stream)  │            │ (one thread)      │           │ (RocksDB)      │
//! └──────────────────┘            └───────────────────┘           └───────┬────────┘
//!          ▲                                                              │
//!          │ replay on room open                 read_all / replace_all   │
//!          └──────────────────────────────────────────────────────────────┤
//!                                                                         ▼
//!                                                                   ┌───────────┐
//!                                                                   │ Compactor │
//!                                                                   └───────────┘
//! ```
//!
//! Records are never edited in place. The only rewrite is compaction, which
//! swaps a prefix of a room's history for one equivalent snapshot record.

pub mod rocks;

pub use rocks::{RoomLog, StoreConfig, StoreError, UpdateLogStore, UpdateRecord};
