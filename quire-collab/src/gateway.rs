//! Session gateway: one state machine per WebSocket connection.
//!
//! ```text
//!  Connecting ──► Authenticating ──► Authorizing ──► Syncing ──► Active
//!      │               │                  │             │           │
//!      └───────────────┴──────────────────┴─────────────┴───────────┴──► Closing ──► Closed
//! ```
//!
//! - `Authenticating`: resolve an identity from the token or session cookie.
//!   None resolves: close 4001.
//! - `Authorizing`: rooms whose key is document-scoped (`page:<id>` and its
//!   sanitized aliases) ask [`AccessControl`]. Denied: close 4003.
//! - `Syncing`: open the room, join its broadcast group, send our state vector,
//!   wait for the client's and answer with the diff. Every step is bounded;
//!   a missed deadline closes with 1011.
//! - `Active`: sync frames are merged into the room's engine and relayed
//!   verbatim to the other members; other tags are relayed untouched.
//! - `Closing`: best-effort close frame, leave the group, release the room.
//!
//! Authorization happens once. Membership established in `Syncing` is the
//! only thing checked per message.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::sync::SyncMessage;

use crate::auth::{resolve_identity, AccessControl, Authenticator, ConnectRequest, Identity};
use crate::broadcast::RoomFrame;
use crate::protocol::{decode_frame, sync_step1, sync_step2, sync_update, CloseReason, Frame};
use crate::registry::{Room, RoomLease, RoomRegistry};
use crate::room::RoomKey;

/// Per-session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Deadline for the access check.
    pub authorize_timeout_ms: u64,
    /// Deadline for opening (or loading) the room.
    pub make_room_timeout_ms: u64,
    /// Deadline for joining the broadcast group.
    pub join_timeout_ms: u64,
    /// Deadline for each handshake step.
    pub handshake_timeout_ms: u64,
    /// Undecodable updates tolerated before the session is closed.
    pub max_invalid_updates: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            authorize_timeout_ms: 2000,
            make_room_timeout_ms: 2000,
            join_timeout_ms: 1000,
            handshake_timeout_ms: 1000,
            max_invalid_updates: 3,
        }
    }
}

impl GatewayConfig {
    pub fn for_testing() -> Self {
        Self {
            authorize_timeout_ms: 500,
            make_room_timeout_ms: 500,
            join_timeout_ms: 500,
            handshake_timeout_ms: 300,
            max_invalid_updates: 3,
        }
    }

    fn authorize_timeout(&self) -> Duration {
        Duration::from_millis(self.authorize_timeout_ms)
    }

    fn make_room_timeout(&self) -> Duration {
        Duration::from_millis(self.make_room_timeout_ms)
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authorizing,
    Syncing,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Authenticating)
            | (Authenticating, Authorizing)
            | (Authorizing, Syncing)
            | (Syncing, Active)
            | (Closing, Closed) => true,
            (Connecting | Authenticating | Authorizing | Syncing | Active, Closing) => true,
            _ => false,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub close: CloseReason,
    /// Every state the session passed through, in order.
    pub states: Vec<SessionState>,
}

impl SessionOutcome {
    pub fn reached_active(&self) -> bool {
        self.states.contains(&SessionState::Active)
    }
}

enum Transition {
    Next(SessionState),
    Close(CloseReason),
}

/// Shared entry point for every connection.
#[derive(Clone)]
pub struct Gateway {
    registry: RoomRegistry,
    authenticator: Arc<dyn Authenticator>,
    access: Arc<dyn AccessControl>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        registry: RoomRegistry,
        authenticator: Arc<dyn Authenticator>,
        access: Arc<dyn AccessControl>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            authenticator,
            access,
            config,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Drive an accepted WebSocket through the session lifecycle.
    pub async fn serve<S>(&self, ws: WebSocketStream<S>, request: ConnectRequest) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (sink, stream) = ws.split();
        let session = Session {
            gateway: self,
            id: Uuid::new_v4(),
            room_key: RoomKey::derive(&request.room),
            request,
            state: SessionState::Connecting,
            states: vec![SessionState::Connecting],
            sink,
            stream,
            identity: None,
            lease: None,
            room: None,
            frames: None,
            invalid_updates: 0,
        };
        session.run().await
    }
}

struct Session<'g, S> {
    gateway: &'g Gateway,
    id: Uuid,
    request: ConnectRequest,
    room_key: RoomKey,
    state: SessionState,
    states: Vec<SessionState>,
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    identity: Option<Identity>,
    lease: Option<RoomLease>,
    room: Option<Arc<Room>>,
    frames: Option<broadcast::Receiver<RoomFrame>>,
    invalid_updates: u32,
}

impl<S> Session<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(mut self) -> SessionOutcome {
        let mut close = CloseReason::Normal;

        loop {
            let transition = match self.state {
                SessionState::Connecting => self.connect(),
                SessionState::Authenticating => self.authenticate().await,
                SessionState::Authorizing => self.authorize().await,
                SessionState::Syncing => self.sync().await,
                SessionState::Active => self.relay().await,
                SessionState::Closing => {
                    self.shutdown(close).await;
                    Transition::Next(SessionState::Closed)
                }
                SessionState::Closed => break,
            };

            match transition {
                Transition::Next(next) => self.advance(next),
                Transition::Close(reason) => {
                    close = reason;
                    self.advance(SessionState::Closing);
                }
            }
        }

        SessionOutcome {
            close,
            states: self.states,
        }
    }

    fn advance(&mut self, next: SessionState) {
        let next = if self.state.can_advance_to(next) {
            next
        } else {
            log::error!("Illegal session transition {:?} -> {next:?}", self.state);
            match self.state {
                SessionState::Closing | SessionState::Closed => SessionState::Closed,
                _ => SessionState::Closing,
            }
        };
        log::trace!("Session {} {:?} -> {next:?}", self.id, self.state);
        self.state = next;
        self.states.push(next);
    }

    // ─── Setup ────────────────────────────────────────────────────────

    fn connect(&mut self) -> Transition {
        log::info!(
            "Connection attempt to {} (token: {}, session: {})",
            self.room_key,
            self.request.token.is_some(),
            self.request.session_id.is_some()
        );
        Transition::Next(SessionState::Authenticating)
    }

    async fn authenticate(&mut self) -> Transition {
        let authenticator = self.gateway.authenticator.clone();
        let request = self.request.clone();
        let resolved =
            tokio::task::spawn_blocking(move || resolve_identity(authenticator.as_ref(), &request))
                .await;

        match resolved {
            Ok(Some(identity)) => {
                log::debug!("Authenticated {} for {}", identity.name, self.room_key);
                self.identity = Some(identity);
                Transition::Next(SessionState::Authorizing)
            }
            Ok(None) => {
                log::warn!("Rejected connection to {}: not authenticated", self.room_key);
                Transition::Close(CloseReason::Unauthenticated)
            }
            Err(e) => {
                log::error!("Authentication task failed: {e}");
                Transition::Close(CloseReason::Internal)
            }
        }
    }

    async fn authorize(&mut self) -> Transition {
        let Some(document_id) = self.room_key.document_id().map(str::to_string) else {
            return Transition::Next(SessionState::Syncing);
        };
        let Some(identity) = self.identity.clone() else {
            return Transition::Close(CloseReason::Unauthenticated);
        };

        let access = self.gateway.access.clone();
        let user = identity.name.clone();
        let check =
            tokio::task::spawn_blocking(move || access.has_access(&document_id, &identity));

        match timeout(self.gateway.config.authorize_timeout(), check).await {
            Ok(Ok(true)) => Transition::Next(SessionState::Syncing),
            Ok(Ok(false)) => {
                log::warn!("Denied {user} access to {}", self.room_key);
                Transition::Close(CloseReason::AccessDenied)
            }
            Ok(Err(e)) => {
                log::error!("Access check task failed: {e}");
                Transition::Close(CloseReason::Internal)
            }
            Err(_) => {
                log::warn!("Access check for {} timed out", self.room_key);
                Transition::Close(CloseReason::SetupTimeout)
            }
        }
    }

    async fn sync(&mut self) -> Transition {
        let gateway = self.gateway;
        let config = &gateway.config;

        log::debug!("Opening room {}", self.room_key);
        let lease = self
            .lease
            .insert(gateway.registry.lease(self.room_key.clone()));
        let room = match timeout(config.make_room_timeout(), lease.room()).await {
            Ok(Ok(room)) => room,
            Ok(Err(e)) => {
                log::error!("Could not open room {}: {e}", self.room_key);
                return Transition::Close(CloseReason::Internal);
            }
            Err(_) => {
                log::warn!(
                    "Opening room {} timed out; the load continues in the background \
                     (compacting its log shortens replay)",
                    self.room_key
                );
                return Transition::Close(CloseReason::SetupTimeout);
            }
        };
        self.room = Some(room.clone());

        let user = self
            .identity
            .as_ref()
            .map(|identity| identity.name.clone())
            .unwrap_or_default();
        let frames = match timeout(
            config.join_timeout(),
            room.broadcast().add_member(self.id, user),
        )
        .await
        {
            Ok(frames) => frames,
            Err(_) => {
                log::warn!("Joining room {} timed out", self.room_key);
                return Transition::Close(CloseReason::SetupTimeout);
            }
        };
        self.frames = Some(frames);
        log::info!("Accepted session {} in {}", self.id, self.room_key);

        let step1 = sync_step1(room.engine().state_vector());
        match timeout(config.handshake_timeout(), self.send(step1)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Transition::Close(reason),
            Err(_) => return Transition::Close(CloseReason::SetupTimeout),
        }

        match timeout(config.handshake_timeout(), self.await_client_step1(&room)).await {
            Ok(Ok(())) => {
                log::debug!("Sync handshake done for {} in {}", self.id, self.room_key);
                Transition::Next(SessionState::Active)
            }
            Ok(Err(reason)) => Transition::Close(reason),
            Err(_) => {
                log::warn!("Sync handshake with {} timed out", self.id);
                Transition::Close(CloseReason::SetupTimeout)
            }
        }
    }

    /// Process inbound frames until the client's state vector has been answered.
    async fn await_client_step1(&mut self, room: &Arc<Room>) -> Result<(), CloseReason> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if self.on_binary(room, data.into()).await? == Inbound::AnsweredStep1 {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(CloseReason::TransportClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Transport error during handshake: {e}");
                    return Err(CloseReason::TransportClosed);
                }
            }
        }
    }

    // ─── Relay ────────────────────────────────────────────────────────

    async fn relay(&mut self) -> Transition {
        let (Some(room), Some(mut frames)) = (self.room.clone(), self.frames.take()) else {
            return Transition::Close(CloseReason::Internal);
        };

        let reason = loop {
            tokio::select! {
                inbound = self.stream.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(reason) = self.on_binary(&room, data.into()).await {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::TransportClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Transport error in {}: {e}", self.room_key);
                        break CloseReason::TransportClosed;
                    }
                },
                frame = frames.recv() => match frame {
                    Ok(frame) if frame.origin == self.id => {}
                    Ok(frame) => {
                        if let Err(reason) = self.send(frame.payload.to_vec()).await {
                            break reason;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        room.broadcast().record_lag(missed);
                        log::warn!(
                            "Session {} in {} lagged by {missed} frames; resending full state",
                            self.id,
                            self.room_key
                        );
                        let full = sync_update(room.engine().encode_full_state());
                        if let Err(reason) = self.send(full).await {
                            break reason;
                        }
                    }
                    Err(RecvError::Closed) => break CloseReason::Internal,
                },
            }
        };

        Transition::Close(reason)
    }

    /// Handle one binary frame from the client.
    async fn on_binary(&mut self, room: &Arc<Room>, bytes: Vec<u8>) -> Result<Inbound, CloseReason> {
        match decode_frame(&bytes) {
            Ok(Frame::Sync(SyncMessage::SyncStep1(state_vector))) => {
                let diff = room.engine().encode_diff_from(&state_vector);
                self.send(sync_step2(diff)).await?;
                Ok(Inbound::AnsweredStep1)
            }
            Ok(Frame::Sync(SyncMessage::SyncStep2(update) | SyncMessage::Update(update))) => {
                match room.engine().apply(&update) {
                    Ok(()) => {
                        room.broadcast().broadcast_from(self.id, Arc::new(bytes));
                        Ok(Inbound::Relayed)
                    }
                    Err(e) => self.reject(e.to_string()),
                }
            }
            Ok(Frame::Passthrough(_)) => {
                room.broadcast().broadcast_from(self.id, Arc::new(bytes));
                Ok(Inbound::Relayed)
            }
            Err(e) => self.reject(e.to_string()),
        }
    }

    /// Drop a bad frame; close once too many have been seen.
    fn reject(&mut self, error: String) -> Result<Inbound, CloseReason> {
        self.invalid_updates += 1;
        log::warn!(
            "Dropped invalid frame {}/{} from {} in {}: {error}",
            self.invalid_updates,
            self.gateway.config.max_invalid_updates,
            self.id,
            self.room_key
        );
        if self.invalid_updates >= self.gateway.config.max_invalid_updates.max(1) {
            Err(CloseReason::InvalidPayload)
        } else {
            Ok(Inbound::Dropped)
        }
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), CloseReason> {
        self.sink
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| {
                log::debug!("Send to {} failed: {e}", self.id);
                CloseReason::TransportClosed
            })
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    async fn shutdown(&mut self, reason: CloseReason) {
        let deadline = self.gateway.config.handshake_timeout();
        if let Some(frame) = reason.close_frame() {
            // The peer may already be gone.
            let _ = timeout(deadline, self.sink.send(Message::Close(Some(frame)))).await;
        }
        let _ = timeout(deadline, self.sink.close()).await;

        self.frames = None;
        if let Some(room) = self.room.take() {
            room.broadcast().remove_member(&self.id).await;
        }
        self.lease = None;

        log::info!("Session {} left {}: {reason}", self.id, self.room_key);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    AnsweredStep1,
    Relayed,
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DirectoryConfig, DocumentEntry, StaticDirectory, UserEntry};
    use crate::engine::MergeEngine;
    use crate::protocol::MSG_AWARENESS;
    use crate::storage::{StoreConfig, UpdateLogStore};
    use crate::worker::{PersistenceWorker, WorkerConfig};
    use tempfile::TempDir;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use yrs::{StateVector, Text, WriteTxn};

    type Ws = WebSocketStream<DuplexStream>;

    fn gateway() -> (TempDir, Gateway) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(UpdateLogStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let worker = PersistenceWorker::new(store, WorkerConfig::for_testing());
        let directory = Arc::new(StaticDirectory::from_config(&DirectoryConfig {
            users: vec![
                UserEntry {
                    id: "u1".into(),
                    name: "alice".into(),
                    tokens: vec!["alice".into()],
                    sessions: vec![],
                },
                UserEntry {
                    id: "u2".into(),
                    name: "mallory".into(),
                    tokens: vec!["mallory".into()],
                    sessions: vec![],
                },
            ],
            documents: vec![DocumentEntry {
                id: "abc".into(),
                owner: "u1".into(),
                collaborators: vec![],
            }],
        }));
        let gateway = Gateway::new(
            RoomRegistry::new(worker, 16),
            directory.clone(),
            directory,
            GatewayConfig::for_testing(),
        );
        (dir, gateway)
    }

    async fn connect(gateway: &Gateway, room: &str, token: Option<&str>) -> (Ws, JoinHandle<SessionOutcome>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let request = ConnectRequest {
            room: room.to_string(),
            token: token.map(str::to_string),
            session_id: None,
        };
        let gateway = gateway.clone();
        let session = tokio::spawn(async move { gateway.serve(server, request).await });
        (client, session)
    }

    async fn close_code(client: &mut Ws) -> Option<u16> {
        while let Some(message) = client.next().await {
            match message {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    async fn next_sync(client: &mut Ws) -> SyncMessage {
        loop {
            match client.next().await {
                Some(Ok(Message::Binary(data))) => match decode_frame(&data).unwrap() {
                    Frame::Sync(message) => return message,
                    Frame::Passthrough(_) => continue,
                },
                Some(Ok(_)) => continue,
                other => panic!("expected a sync frame, got {other:?}"),
            }
        }
    }

    async fn handshake(client: &mut Ws) {
        assert!(matches!(next_sync(client).await, SyncMessage::SyncStep1(_)));
        client
            .send(Message::Binary(sync_step1(StateVector::default()).into()))
            .await
            .unwrap();
        assert!(matches!(next_sync(client).await, SyncMessage::SyncStep2(_)));
    }

    fn text_update(s: &str) -> Vec<u8> {
        let engine = MergeEngine::with_client_id(77).unwrap();
        let mut changes = engine.observe_changes();
        engine.edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, s);
        });
        changes.try_next().unwrap()
    }

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Connecting.can_advance_to(Authenticating));
        assert!(Authorizing.can_advance_to(Closing));
        assert!(Syncing.can_advance_to(Active));
        assert!(Closing.can_advance_to(Closed));
        assert!(!Authenticating.can_advance_to(Active));
        assert!(!Closed.can_advance_to(Closing));
        assert!(!Closing.can_advance_to(Closing));
        assert!(!Active.can_advance_to(Syncing));
    }

    #[tokio::test]
    async fn test_missing_credentials_close_4001() {
        let (_dir, gateway) = gateway();
        let (mut client, session) = connect(&gateway, "lobby", None).await;

        assert_eq!(close_code(&mut client).await, Some(4001));
        let outcome = session.await.unwrap();
        assert_eq!(outcome.close, CloseReason::Unauthenticated);
        assert!(!outcome.reached_active());
        assert!(!outcome.states.contains(&SessionState::Authorizing));
        assert_eq!(outcome.states.last(), Some(&SessionState::Closed));
    }

    #[tokio::test]
    async fn test_forbidden_document_close_4003() {
        let (_dir, gateway) = gateway();
        let (mut client, session) = connect(&gateway, "page:abc", Some("mallory")).await;

        assert_eq!(close_code(&mut client).await, Some(4003));
        let outcome = session.await.unwrap();
        assert_eq!(outcome.close, CloseReason::AccessDenied);
        assert!(!outcome.reached_active());
        assert_eq!(gateway.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_sanitized_alias_of_document_room_is_checked() {
        let (_dir, gateway) = gateway();

        for alias in ["page_abc", "page/abc", "page abc"] {
            let (mut client, session) = connect(&gateway, alias, Some("mallory")).await;
            assert_eq!(close_code(&mut client).await, Some(4003), "{alias}");
            let outcome = session.await.unwrap();
            assert_eq!(outcome.close, CloseReason::AccessDenied);
            assert!(!outcome.reached_active());
        }
        assert_eq!(gateway.registry().room_count(), 0);

        // The owner still reaches the room through an alias.
        let (mut client, _session) = connect(&gateway, "page_abc", Some("alice")).await;
        handshake(&mut client).await;
        assert_eq!(gateway.registry().room_count(), 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_close_1011() {
        let (_dir, gateway) = gateway();
        let (mut client, session) = connect(&gateway, "page:abc", Some("alice")).await;

        // Read the server's step 1 but never send ours.
        assert!(matches!(next_sync(&mut client).await, SyncMessage::SyncStep1(_)));
        assert_eq!(close_code(&mut client).await, Some(1011));

        let outcome = session.await.unwrap();
        assert_eq!(outcome.close, CloseReason::SetupTimeout);
        assert!(!outcome.reached_active());
    }

    #[tokio::test]
    async fn test_update_is_merged_and_session_closes_cleanly() {
        let (_dir, gateway) = gateway();
        let (mut client, session) = connect(&gateway, "page:abc", Some("alice")).await;
        handshake(&mut client).await;

        client
            .send(Message::Binary(sync_update(text_update("hi")).into()))
            .await
            .unwrap();
        client.close(None).await.unwrap();

        let outcome = session.await.unwrap();
        assert!(outcome.reached_active());
        assert_eq!(outcome.close, CloseReason::TransportClosed);

        gateway.registry().drained().await;
        let records = gateway
            .registry()
            .worker()
            .store()
            .read_all(&RoomKey::derive("page:abc"))
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_between_sessions() {
        let (_dir, gateway) = gateway();
        let (mut alice, _a) = connect(&gateway, "lobby", Some("alice")).await;
        handshake(&mut alice).await;
        let (mut bob, _b) = connect(&gateway, "lobby", Some("mallory")).await;
        handshake(&mut bob).await;

        let update = sync_update(text_update("shared"));
        alice.send(Message::Binary(update.clone().into())).await.unwrap();
        match next_sync(&mut bob).await {
            SyncMessage::Update(bytes) => {
                let replica = MergeEngine::new().unwrap();
                replica.apply(&bytes).unwrap();
                assert_eq!(replica.text("content").as_deref(), Some("shared"));
            }
            other => panic!("expected update, got {other:?}"),
        }

        // Awareness frames are relayed without interpretation.
        let awareness = vec![MSG_AWARENESS, 1, 2, 3];
        bob.send(Message::Binary(awareness.clone().into())).await.unwrap();
        loop {
            match alice.next().await {
                Some(Ok(Message::Binary(data))) if data[0] == MSG_AWARENESS => {
                    assert_eq!(data.to_vec(), awareness);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected awareness frame, got {other:?}"),
            }
        }

        let room = gateway.registry().get(&RoomKey::derive("lobby")).unwrap();
        assert_eq!(room.engine().text("content").as_deref(), Some("shared"));
    }

    #[tokio::test]
    async fn test_repeated_garbage_closes_1007() {
        let (_dir, gateway) = gateway();
        let (mut client, session) = connect(&gateway, "lobby", Some("alice")).await;
        handshake(&mut client).await;

        for _ in 0..3 {
            client
                .send(Message::Binary(vec![0, 2, 3, 0xFF, 0xFF, 0xFF].into()))
                .await
                .unwrap();
        }
        assert_eq!(close_code(&mut client).await, Some(1007));
        assert_eq!(session.await.unwrap().close, CloseReason::InvalidPayload);
    }
}
