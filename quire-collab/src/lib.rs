//! # quire-collab: real-time collaborative document sync
//!
//! Clients connect over WebSocket to a named room, exchange CRDT updates
//! (Yjs binary encoding) with the server's authoritative replica, and see each
//! other's edits relayed in real time. Every accepted change is persisted to an
//! append-only log so a room can be rebuilt after restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   y-protocol sync   │  Gateway    │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ RoomRegistry
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐      ┌───────────────────┐
//! │ MergeEngine │                     │ MergeEngine │ ───► │ PersistenceWorker │
//! │ (replica)   │                     │ (authority) │      └─────────┬─────────┘
//! └─────────────┘                     └──────┬──────┘                ▼
//!                                            │               ┌───────────────┐
//!                                    ┌───────┴───────┐       │ UpdateLogStore│ ◄── Compactor
//!                                    │ BroadcastGroup│       │ (RocksDB)     │
//!                                    └───────────────┘       └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: CRDT document state: merge, encode, diff
//! - [`protocol`]: Wire frames and close codes
//! - [`broadcast`]: Per-room fan-out with backpressure
//! - [`registry`]: Live rooms, loaded from and drained to storage
//! - [`gateway`]: Per-connection session state machine
//! - [`auth`]: Credential and permission checks
//! - [`worker`]: Ordered background persistence
//! - [`compactor`]: Folds a room's log into one snapshot
//! - [`storage`]: RocksDB update log
//! - [`server`] / [`client`]: WebSocket endpoints

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;
pub mod worker;

pub use auth::{
    AccessControl, Authenticator, ConnectRequest, DirectoryConfig, DocumentEntry, Identity,
    StaticDirectory, UserEntry,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use compactor::{CompactError, Compactor};
pub use config::{ConfigError, ServerConfig};
pub use engine::{fold_updates, ChangeStream, MergeEngine, MergeError};
pub use gateway::{Gateway, GatewayConfig, SessionOutcome, SessionState};
pub use protocol::{CloseReason, Frame, ProtocolError};
pub use registry::{RegistryError, Room, RoomLease, RoomRegistry};
pub use room::RoomKey;
pub use server::{ServerError, ServerStats, SyncServer};
pub use storage::{RoomLog, StoreConfig, StoreError, UpdateLogStore, UpdateRecord};
pub use worker::{PersistenceWorker, WorkerConfig, WorkerStats};
