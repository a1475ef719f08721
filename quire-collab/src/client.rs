//! WebSocket sync client.
//!
//! Keeps a local [`MergeEngine`] replica of one room in step with the server:
//! - sends its state vector on connect and answers the server's
//! - merges remote updates as they arrive
//! - ships local edits made through [`SyncClient::edit`] as updates
//!
//! Non-sync frames (awareness and the like) are surfaced untouched.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use yrs::sync::SyncMessage;
use yrs::TransactionMut;

use crate::engine::{MergeEngine, MergeError};
use crate::protocol::{decode_frame, sync_step1, sync_step2, sync_update, Frame};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("connection closed")]
    Disconnected,
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The server has answered our state vector.
    Synced,
    Disconnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Initial sync with the server completed
    Synced,
    /// A remote update was merged into the local replica
    RemoteUpdate(Vec<u8>),
    /// A non-sync frame relayed from another client
    Passthrough { tag: u8, payload: Vec<u8> },
    /// Connection closed, with the server's close code if it sent one
    Closed { code: Option<u16> },
}

/// The sync client.
pub struct SyncClient {
    engine: Arc<MergeEngine>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: mpsc::Receiver<SyncEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Connect to `url`, e.g. `ws://host:9090/ws/yjs/page:abc?token=...`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        Self::from_stream(ws_stream)
    }

    /// Run the sync protocol over an established WebSocket.
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let engine = Arc::new(MergeEngine::new()?);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: merge incoming sync frames, surface everything else
        let reader_engine = engine.clone();
        let reader_state = state.clone();
        let reply_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            let mut close_code = None;
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let event = match decode_frame(&bytes) {
                            Ok(Frame::Sync(SyncMessage::SyncStep1(state_vector))) => {
                                let diff = reader_engine.encode_diff_from(&state_vector);
                                let reply = Message::Binary(sync_step2(diff).into());
                                if reply_tx.send(reply).await.is_err() {
                                    break;
                                }
                                None
                            }
                            Ok(Frame::Sync(SyncMessage::SyncStep2(update))) => {
                                match reader_engine.apply(&update) {
                                    Ok(()) => {
                                        *reader_state.write().await = ConnectionState::Synced;
                                        Some(SyncEvent::Synced)
                                    }
                                    Err(e) => {
                                        log::warn!("Dropping invalid sync reply: {e}");
                                        None
                                    }
                                }
                            }
                            Ok(Frame::Sync(SyncMessage::Update(update))) => {
                                match reader_engine.apply(&update) {
                                    Ok(()) => Some(SyncEvent::RemoteUpdate(update)),
                                    Err(e) => {
                                        log::warn!("Dropping invalid remote update: {e}");
                                        None
                                    }
                                }
                            }
                            Ok(Frame::Passthrough(tag)) => Some(SyncEvent::Passthrough {
                                tag,
                                payload: bytes[1..].to_vec(),
                            }),
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                None
                            }
                        };
                        if let Some(event) = event {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Connection lost: {e}");
                        break;
                    }
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Closed { code: close_code }).await;
        });

        let hello = Message::Binary(sync_step1(engine.state_vector()).into());
        out_tx
            .try_send(hello)
            .map_err(|_| ClientError::Disconnected)?;

        Ok(Self {
            engine,
            state,
            outgoing_tx: out_tx,
            event_rx,
            tasks: vec![writer, reader],
        })
    }

    /// Local replica of the room.
    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.engine.text(name)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Edit the local replica and send the resulting update to the server.
    pub async fn edit<R>(
        &self,
        f: impl FnOnce(&mut TransactionMut<'_>) -> R,
    ) -> Result<R, ClientError> {
        let before = self.engine.state_vector();
        let result = self.engine.edit(f);
        if self.engine.state_vector() != before {
            let delta = self.engine.encode_diff_from(&before);
            self.send_raw(sync_update(delta)).await?;
        }
        Ok(result)
    }

    /// Send an already encoded frame, e.g. an awareness message.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Next event, or `None` once the connection is gone and drained.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.event_rx.recv().await
    }

    /// Next event within `wait`.
    pub async fn next_event_within(&mut self, wait: Duration) -> Option<SyncEvent> {
        tokio::time::timeout(wait, self.event_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for(
        &mut self,
        wait: Duration,
        mut pred: impl FnMut(&SyncEvent) -> bool,
    ) -> Option<SyncEvent> {
        tokio::time::timeout(wait, async {
            while let Some(event) = self.event_rx.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Send a close frame and stop the background tasks.
    pub async fn close(mut self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = self.event_rx.recv().await {
                if matches!(event, SyncEvent::Closed { .. }) {
                    break;
                }
            }
        })
        .await;
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
