//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Room "page:abc" ── MergeEngine ── BroadcastGroup
//!             ├── Gateway (per session) ┤          │
//! Client B ──┘                         └── Room "lobby"     ...
//!                                                  │ change stream
//!                                                  ▼
//!                                         PersistenceWorker ── UpdateLogStore (RocksDB)
//!                                                                     ▲
//!                                              Compactor (periodic) ──┘
//! ```
//!
//! The server owns the shared pieces (store, worker, registry) and spawns one
//! [`Gateway`] session per accepted connection. Upgrade requests outside the
//! route prefix are refused with 404 before the WebSocket handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::auth::{AccessControl, Authenticator, ConnectRequest, StaticDirectory};
use crate::compactor::Compactor;
use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::protocol::CloseReason;
use crate::registry::RoomRegistry;
use crate::storage::{StoreError, UpdateLogStore};
use crate::worker::PersistenceWorker;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Sessions that reached the active state.
    pub synced_sessions: u64,
    /// Sessions closed for missing credentials or permissions.
    pub rejected_sessions: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicU64,
    synced: AtomicU64,
    rejected: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Gateway,
    compactor: Compactor,
    counters: Arc<Counters>,
}

impl SyncServer {
    /// Open the store and wire the shared services together.
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self, ServerError> {
        let store = Arc::new(UpdateLogStore::open(config.store.clone())?);
        let worker = PersistenceWorker::new(store.clone(), config.worker.clone());
        let registry = RoomRegistry::new(worker, config.broadcast_capacity);
        let gateway = Gateway::new(registry, authenticator, access, config.gateway.clone());

        Ok(Self {
            config,
            gateway,
            compactor: Compactor::new(store),
            counters: Arc::default(),
        })
    }

    /// Server whose users and permissions come from `config.directory`.
    pub fn with_directory(config: ServerConfig) -> Result<Self, ServerError> {
        let directory = Arc::new(StaticDirectory::from_config(&config.directory));
        Self::new(config, directory.clone(), directory)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        self.gateway.registry()
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            synced_sessions: self.counters.synced.load(Ordering::Relaxed),
            rejected_sessions: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Write out every update still queued by live or evicted rooms.
    ///
    /// Call after the accept loop has stopped and before the process exits.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let registry = self.registry();
        registry.shutdown().await;
        registry.worker().store().sync()?;
        log::info!("Sync server stopped");
        Ok(())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Sync server listening on {}{}",
            listener.local_addr()?,
            self.config.route_prefix
        );

        let compaction = self.spawn_compaction();
        let result = self.accept_loop(listener).await;
        if let Some(task) = compaction {
            task.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let route_prefix = self.config.route_prefix.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                counters.total.fetch_add(1, Ordering::Relaxed);
                counters.active.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    handle_connection(stream, addr, &gateway, &route_prefix, &counters).await
                {
                    log::warn!("Connection error from {addr}: {e}");
                }
                counters.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    fn spawn_compaction(&self) -> Option<JoinHandle<()>> {
        let period = Duration::from_secs(self.config.compact_interval_secs?.max(1));
        let compactor = self.compactor.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let compactor = compactor.clone();
                match tokio::task::spawn_blocking(move || compactor.compact_all()).await {
                    Ok(Ok(rooms)) => log::info!("Periodic compaction: {rooms} rooms compacted"),
                    Ok(Err(e)) => log::error!("Periodic compaction failed: {e}"),
                    Err(e) => log::error!("Periodic compaction task failed: {e}"),
                }
            }
        }))
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: &Gateway,
    route_prefix: &str,
    counters: &Counters,
) -> Result<(), ServerError> {
    let mut connect = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match ConnectRequest::from_http(request, route_prefix) {
            Some(parsed) => {
                connect = Some(parsed);
                Ok(response)
            }
            None => {
                log::debug!("Refused upgrade for {} from {addr}", request.uri().path());
                let mut error = ErrorResponse::new(Some("unknown route".to_string()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let Some(request) = connect else {
        return Ok(());
    };
    log::info!("WebSocket connection established from {addr} for {}", request.room);

    let outcome = gateway.serve(ws_stream, request).await;
    if outcome.reached_active() {
        counters.synced.fetch_add(1, Ordering::Relaxed);
    }
    if matches!(
        outcome.close,
        CloseReason::Unauthenticated | CloseReason::AccessDenied
    ) {
        counters.rejected.fetch_add(1, Ordering::Relaxed);
    }
    log::debug!("Connection from {addr} finished: {}", outcome.close);
    Ok(())
}
