//! # ledger-core — shared board-game ledger model
//!
//! Pure, synchronous building blocks for a room: the authoritative
//! [`GameState`] and its merge/apply rules, the undo/redo [`History`],
//! the [`ApprovalCoordinator`] vote tally and the [`PresenceTracker`].
//!
//! Nothing in this crate spawns tasks or touches the network; the
//! per-room serialization lives in `ledger-collab`.
//!
//! ```text
//!   Action / partial GameState
//!              │
//!              ▼
//!   GameState::apply / merged ──► Arc<GameState> (new snapshot)
//!              │
//!              ▼
//!   History::append(before, after)   undo ◄──► redo
//! ```

pub mod action;
pub mod approval;
pub mod error;
pub mod history;
pub mod presence;
pub mod state;

pub use action::{Action, ActionDescriptor, Direction};
pub use approval::{ApprovalCoordinator, PendingApproval, VoteOutcome};
pub use error::StateError;
pub use history::{History, HistoryStep, LogEntry};
pub use presence::{JoinKind, Participant, ParticipantStatus, PresenceTracker};
pub use state::{GameState, Money, PlayerEntry, PlayerId};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
