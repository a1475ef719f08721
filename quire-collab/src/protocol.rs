//! Wire framing for the y-websocket sync protocol.
//!
//! Every WebSocket binary message is one frame:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ tag      │ body                                         │
//! │ varint   │ tag 0: sync sub-message, otherwise opaque    │
//! └──────────┴──────────────────────────────────────────────┘
//!
//! sync body:
//! ┌──────────┬──────────────────────────┐
//! │ sub-tag  │ varbuf                   │
//! │ 0 step 1 │ encoded state vector     │
//! │ 1 step 2 │ update                   │
//! │ 2 update │ update                   │
//! └──────────┴──────────────────────────┘
//! ```
//!
//! Only tag 0 is interpreted by the server. Awareness (tag 1) and anything else
//! is relayed to the room untouched.

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Frame tag of sync messages.
pub const MSG_SYNC: u8 = 0;
/// Frame tag of awareness messages.
pub const MSG_AWARENESS: u8 = 1;

/// A decoded inbound frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// Tag 0: handshake step or incremental update.
    Sync(SyncMessage),
    /// Any other tag. The raw bytes are relayed as received.
    Passthrough(u8),
}

/// Classify a binary frame.
///
/// Non-sync frames are never parsed beyond their first byte.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    match bytes.split_first() {
        None => Err(ProtocolError::EmptyFrame),
        Some((&MSG_SYNC, body)) => SyncMessage::decode_v1(body)
            .map(Frame::Sync)
            .map_err(|e| ProtocolError::MalformedSync(e.to_string())),
        Some((&tag, _)) => Ok(Frame::Passthrough(tag)),
    }
}

/// Sync step 1 frame carrying our state vector.
pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Sync step 2 frame carrying the diff a peer is missing.
pub fn sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

/// Incremental update frame.
pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Why a session was closed, mapped onto WebSocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client or server ended the session normally.
    Normal,
    /// No identity could be established (4001).
    Unauthenticated,
    /// Authenticated user lacks access to the document (4003).
    AccessDenied,
    /// A setup step exceeded its deadline (1011).
    SetupTimeout,
    /// Server-side failure while serving the session (1011).
    Internal,
    /// The client kept sending updates that could not be merged (1007).
    InvalidPayload,
    /// The peer went away; nothing is sent back.
    TransportClosed,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Unauthenticated => 4001,
            Self::AccessDenied => 4003,
            Self::SetupTimeout | Self::Internal => 1011,
            Self::InvalidPayload => 1007,
            Self::TransportClosed => 1006,
        }
    }

    /// Close frame to send, if any.
    pub fn close_frame(self) -> Option<CloseFrame> {
        if self == Self::TransportClosed {
            return None;
        }
        Some(CloseFrame {
            code: CloseCode::from(self.code()),
            reason: "".into(),
        })
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Normal => "normal",
            Self::Unauthenticated => "unauthenticated",
            Self::AccessDenied => "access denied",
            Self::SetupTimeout => "setup timeout",
            Self::Internal => "internal error",
            Self::InvalidPayload => "invalid payload",
            Self::TransportClosed => "transport closed",
        };
        write!(f, "{label} ({})", self.code())
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("malformed sync message: {0}")]
    MalformedSync(String),
}
