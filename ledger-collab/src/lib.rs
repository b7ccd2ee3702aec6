//! # ledger-collab — real-time room sync for the board-game ledger
//!
//! Hosts many independent rooms behind one WebSocket listener. Each room is
//! an actor task that applies its commands one at a time and fans the
//! resulting snapshots out to every connection in the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ RoomManager │
//!                                     └──────┬──────┘
//!                                            │ RoomHandle (mpsc)
//!                                     ┌──────┴──────┐
//!                                     │ sequencer   │──► Room (ledger-core)
//!                                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary envelope with JSON requests and events
//! - [`broadcast`] — Room fan-out with targeted frames
//! - [`room`] — One room's state, history, approvals and presence
//! - [`sequencer`] — Per-room command queue and actor loop
//! - [`registry`] — Room lifecycle and retention sweep
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod room_id;
pub mod sequencer;
pub mod server;

// Re-exports for convenience
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Outbound};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{RoomConfig, ServerConfig};
pub use error::{ErrorCode, RoomError};
pub use protocol::{
    ClientRequest, MessageType, ProtocolError, RoomSnapshot, RoomSummary, ServerEvent,
    SyncMessage,
};
pub use registry::RoomManager;
pub use room::{Room, TradeKind};
pub use room_id::{RoomCode, RoomCodeError};
pub use sequencer::{RoomCommand, RoomHandle};
pub use server::{ServerStats, SyncServer};
