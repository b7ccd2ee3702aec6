use thiserror::Error;

use crate::state::PlayerId;

/// Errors produced by the pure ledger model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("unknown player: {0}")]
    UnknownPlayer(PlayerId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid player entry `{key}`: {reason}")]
    InvalidPlayer { key: String, reason: String },
    #[error("unknown approval: {0}")]
    UnknownApproval(String),
    #[error("approval already pending: {0}")]
    DuplicateApproval(String),
}
