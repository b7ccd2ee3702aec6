//! Wire protocol for room traffic.
//!
//! Every WebSocket binary frame is one bincode-encoded envelope:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬─────────────────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload             │
//! │ 1 byte   │ 16 bytes  │ ≤7 bytes │ varint   │ JSON document       │
//! └──────────┴───────────┴──────────┴──────────┴─────────────────────┘
//! ```
//!
//! `payload` holds a [`ClientRequest`] (for `Request`) or a [`ServerEvent`]
//! (for `Event`), both tagged by `"type"`. Game state is arbitrary JSON,
//! which bincode cannot describe, hence the nested document.
//!
//! `clock` is the room state version on server events and is ignored on
//! requests. `peer_id` is the originating connection, nil for the server.

use ledger_core::{
    Action, ActionDescriptor, GameState, LogEntry, ParticipantStatus, PendingApproval,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Message types for the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client → server request
    Request = 1,
    /// Server → client event
    Event = 2,
    /// Heartbeat ping
    Ping = 3,
    /// Heartbeat pong
    Pong = 4,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Room code, empty when the message is not room-scoped
    pub room: String,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn request(
        peer_id: Uuid,
        room: impl Into<String>,
        request: &ClientRequest,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Request,
            peer_id,
            room: room.into(),
            clock: 0,
            payload: to_json(request)?,
        })
    }

    pub fn event(
        room: impl Into<String>,
        clock: u64,
        event: &ServerEvent,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Event,
            peer_id: Uuid::nil(),
            room: room.into(),
            clock,
            payload: to_json(event)?,
        })
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            room: String::new(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            ..Self::ping(peer_id)
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the request payload.
    pub fn client_request(&self) -> Result<ClientRequest, ProtocolError> {
        if self.msg_type != MessageType::Request {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the event payload.
    pub fn server_event(&self) -> Result<ServerEvent, ProtocolError> {
        if self.msg_type != MessageType::Event {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Requests
// ───────────────────────────────────────────────────────────────────

/// Everything a client can ask for.
///
/// The lifecycle requests (`create_room` through `delete_room`) are answered
/// to the requester only. The rest act on the room the connection joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    CreateRoom,
    RoomSummary {
        room: String,
    },
    FetchState {
        room: String,
    },
    ResetRoom {
        room: String,
    },
    DeleteRoom {
        room: String,
    },
    Join {
        room: String,
        name: String,
    },
    Heartbeat {
        room: String,
    },
    SubmitState {
        room: String,
        state: GameState,
        #[serde(default)]
        action: Option<ActionDescriptor>,
    },
    SubmitAction {
        room: String,
        action: Action,
        #[serde(default)]
        description: Option<String>,
    },
    Undo {
        room: String,
    },
    Redo {
        room: String,
    },
    RequestApproval {
        room: String,
        action: ActionDescriptor,
        #[serde(default)]
        approval_id: Option<String>,
    },
    /// Routed to the room the voting connection joined.
    Vote {
        approval_id: String,
        approve: bool,
        #[serde(default)]
        voter_name: Option<String>,
    },
    ProposeTrade {
        room: String,
        to: String,
        trade: Value,
    },
    AcceptTrade {
        room: String,
        to: String,
        trade: Value,
    },
    RejectTrade {
        room: String,
        to: String,
        trade: Value,
    },
}

impl ClientRequest {
    /// Room named by the request, if any.
    pub fn room(&self) -> Option<&str> {
        match self {
            ClientRequest::CreateRoom | ClientRequest::Vote { .. } => None,
            ClientRequest::RoomSummary { room }
            | ClientRequest::FetchState { room }
            | ClientRequest::ResetRoom { room }
            | ClientRequest::DeleteRoom { room }
            | ClientRequest::Join { room, .. }
            | ClientRequest::Heartbeat { room }
            | ClientRequest::SubmitState { room, .. }
            | ClientRequest::SubmitAction { room, .. }
            | ClientRequest::Undo { room }
            | ClientRequest::Redo { room }
            | ClientRequest::RequestApproval { room, .. }
            | ClientRequest::ProposeTrade { room, .. }
            | ClientRequest::AcceptTrade { room, .. }
            | ClientRequest::RejectTrade { room, .. } => Some(room),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Lightweight room description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room: String,
    pub created_at: u64,
    pub version: u64,
    pub online_count: usize,
    pub participants: Vec<ParticipantStatus>,
}

/// Full room contents: state plus both history stacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: String,
    pub state: GameState,
    pub action_log: Vec<LogEntry>,
    pub redo_log: Vec<LogEntry>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomCreated {
        room: String,
    },
    RoomSummary(RoomSummary),
    RoomState(RoomSnapshot),
    RoomDeleted {
        room: String,
    },
    RoomReset {
        room: String,
    },
    ParticipantJoined {
        participant: ParticipantStatus,
        reconnected: bool,
        participants: Vec<ParticipantStatus>,
    },
    ParticipantLeft {
        name: String,
        participants: Vec<ParticipantStatus>,
    },
    Presence {
        participants: Vec<ParticipantStatus>,
    },
    StateUpdated {
        state: GameState,
        version: u64,
    },
    LogsUpdated {
        action_log: Vec<LogEntry>,
        redo_log: Vec<LogEntry>,
    },
    ApprovalRequested {
        approval: PendingApproval,
    },
    ApprovalUpdated {
        approval_id: String,
        approvals: usize,
        rejections: usize,
    },
    ActionApproved {
        approval: PendingApproval,
    },
    ActionRejected {
        approval: PendingApproval,
    },
    TradeProposed {
        from: String,
        trade: Value,
    },
    TradeAccepted {
        from: String,
        trade: Value,
    },
    TradeRejected {
        from: String,
        trade: Value,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
}
