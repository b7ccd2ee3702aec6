//! Room-level errors and the codes clients see.

use ledger_core::{PlayerId, StateError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single request. Scoped to one room and one requester.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoomError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("unknown approval: {0}")]
    UnknownApproval(String),
    #[error("approval already pending: {0}")]
    DuplicateApproval(String),
    #[error("unknown player: {0}")]
    UnknownPlayer(PlayerId),
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),
    #[error("not joined: {0}")]
    NotJoined(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("operation failed: {0}")]
    OperationFailure(String),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            RoomError::UnknownApproval(_) => ErrorCode::UnknownApproval,
            RoomError::DuplicateApproval(_) => ErrorCode::DuplicateApproval,
            RoomError::UnknownPlayer(_) => ErrorCode::UnknownPlayer,
            RoomError::UnknownParticipant(_) => ErrorCode::UnknownParticipant,
            RoomError::NotJoined(_) => ErrorCode::NotJoined,
            RoomError::InvalidState(_) => ErrorCode::InvalidState,
            RoomError::OperationFailure(_) => ErrorCode::OperationFailure,
        }
    }
}

impl From<StateError> for RoomError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::UnknownPlayer(id) => RoomError::UnknownPlayer(id),
            StateError::UnknownApproval(id) => RoomError::UnknownApproval(id),
            StateError::DuplicateApproval(id) => RoomError::DuplicateApproval(id),
            StateError::InvalidState(reason) => RoomError::InvalidState(reason),
            other @ StateError::InvalidPlayer { .. } => RoomError::InvalidState(other.to_string()),
        }
    }
}

/// Machine-readable error kind carried in `ServerEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomNotFound,
    UnknownApproval,
    DuplicateApproval,
    UnknownPlayer,
    UnknownParticipant,
    NotJoined,
    InvalidState,
    OperationFailure,
}
