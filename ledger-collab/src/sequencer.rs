//! Per-room operation sequencer.
//!
//! Each room is owned by one tokio task that drains a bounded command
//! queue:
//!
//! ```text
//!  conn A ─┐                        ┌──────────────────────────────┐
//!  conn B ─┼─► mpsc<RoomCommand> ──►│ loop { recv → Room::handler } │──► BroadcastGroup
//!  sweep  ─┘     (FIFO, bounded)    └──────────────┬───────────────┘
//!                                                  └─► oneshot reply per command
//! ```
//!
//! Commands of one room run strictly one after another in enqueue order;
//! rooms never wait on each other. A handler that panics fails only its
//! own command (the caller sees `OperationFailure`) and the loop moves on
//! to the next one. After `Close` every queued and future command fails
//! with `RoomNotFound`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ledger_core::{
    now_millis, Action, ActionDescriptor, GameState, ParticipantStatus, PendingApproval,
    VoteOutcome,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Outbound};
use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::protocol::{RoomSnapshot, RoomSummary};
use crate::room::{Room, TradeKind};
use crate::room_id::RoomCode;

pub type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

/// Everything a room can be asked to do.
pub enum RoomCommand {
    Join {
        connection_id: Uuid,
        name: String,
        reply: Reply<ParticipantStatus>,
    },
    Heartbeat {
        connection_id: Uuid,
        reply: Reply<()>,
    },
    Disconnect {
        connection_id: Uuid,
        reply: Reply<Option<String>>,
    },
    SubmitState {
        connection_id: Uuid,
        state: GameState,
        descriptor: Option<ActionDescriptor>,
        reply: Reply<u64>,
    },
    SubmitAction {
        connection_id: Uuid,
        action: Action,
        description: Option<String>,
        reply: Reply<u64>,
    },
    Undo {
        connection_id: Uuid,
        reply: Reply<u64>,
    },
    Redo {
        connection_id: Uuid,
        reply: Reply<u64>,
    },
    Reset {
        reply: Reply<u64>,
    },
    RequestApproval {
        connection_id: Uuid,
        descriptor: ActionDescriptor,
        approval_id: Option<String>,
        reply: Reply<PendingApproval>,
    },
    Vote {
        connection_id: Uuid,
        approval_id: String,
        approve: bool,
        reply: Reply<VoteOutcome>,
    },
    Trade {
        connection_id: Uuid,
        kind: TradeKind,
        to: String,
        trade: Value,
        reply: Reply<()>,
    },
    Summary {
        reply: Reply<RoomSummary>,
    },
    Snapshot {
        reply: Reply<RoomSnapshot>,
    },
    /// Stop the actor. Commands behind it are refused.
    Close,
    #[cfg(test)]
    Panic {
        reply: Reply<()>,
    },
}

impl RoomCommand {
    /// Settle the command with `err` without running it.
    fn refuse(self, err: RoomError) {
        // A closed reply channel means the caller gave up; nothing to do.
        match self {
            RoomCommand::Join { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Heartbeat { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Disconnect { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::SubmitState { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::SubmitAction { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Undo { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Redo { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Reset { reply } => drop(reply.send(Err(err))),
            RoomCommand::RequestApproval { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Vote { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Trade { reply, .. } => drop(reply.send(Err(err))),
            RoomCommand::Summary { reply } => drop(reply.send(Err(err))),
            RoomCommand::Snapshot { reply } => drop(reply.send(Err(err))),
            RoomCommand::Close => {}
            #[cfg(test)]
            RoomCommand::Panic { reply } => drop(reply.send(Err(err))),
        }
    }
}

/// Run one command against the room. Replies are sent from here so a
/// panic drops the sender unsent.
fn dispatch(room: &mut Room, command: RoomCommand) {
    let now = now_millis();
    match command {
        RoomCommand::Join {
            connection_id,
            name,
            reply,
        } => drop(reply.send(room.join(connection_id, &name, now))),
        RoomCommand::Heartbeat {
            connection_id,
            reply,
        } => drop(reply.send(room.heartbeat(connection_id, now))),
        RoomCommand::Disconnect {
            connection_id,
            reply,
        } => drop(reply.send(Ok(room.disconnect(connection_id, now)))),
        RoomCommand::SubmitState {
            connection_id,
            state,
            descriptor,
            reply,
        } => drop(reply.send(room.submit_state(connection_id, &state, descriptor, now))),
        RoomCommand::SubmitAction {
            connection_id,
            action,
            description,
            reply,
        } => drop(reply.send(room.submit_action(connection_id, &action, description, now))),
        RoomCommand::Undo {
            connection_id,
            reply,
        } => drop(reply.send(room.undo(connection_id))),
        RoomCommand::Redo {
            connection_id,
            reply,
        } => drop(reply.send(room.redo(connection_id))),
        RoomCommand::Reset { reply } => drop(reply.send(Ok(room.reset()))),
        RoomCommand::RequestApproval {
            connection_id,
            descriptor,
            approval_id,
            reply,
        } => drop(reply.send(room.request_approval(connection_id, descriptor, approval_id, now))),
        RoomCommand::Vote {
            connection_id,
            approval_id,
            approve,
            reply,
        } => drop(reply.send(room.vote(connection_id, &approval_id, approve, now))),
        RoomCommand::Trade {
            connection_id,
            kind,
            to,
            trade,
            reply,
        } => drop(reply.send(room.trade(connection_id, kind, &to, trade))),
        RoomCommand::Summary { reply } => drop(reply.send(Ok(room.summary(now)))),
        RoomCommand::Snapshot { reply } => drop(reply.send(Ok(room.snapshot()))),
        RoomCommand::Close => {}
        #[cfg(test)]
        RoomCommand::Panic { reply } => {
            let _keep = reply;
            panic!("injected handler failure");
        }
    }
}

/// The actor loop.
async fn run(mut room: Room, mut rx: mpsc::Receiver<RoomCommand>) {
    let code = room.code().clone();
    log::debug!("Room {code}: sequencer started");

    while let Some(command) = rx.recv().await {
        if matches!(command, RoomCommand::Close) {
            room.close();
            break;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(&mut room, command)));
        if outcome.is_err() {
            log::error!("Room {code}: command handler panicked; continuing with next command");
        }
    }

    rx.close();
    while let Some(command) = rx.recv().await {
        command.refuse(RoomError::RoomNotFound(code.to_string()));
    }
    log::debug!("Room {code}: sequencer stopped");
}

/// Cloneable address of a room's sequencer.
#[derive(Clone)]
pub struct RoomHandle {
    code: RoomCode,
    created_at: u64,
    participants: Arc<AtomicUsize>,
    broadcast: Arc<BroadcastGroup>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Spawn the actor for a fresh room. Must be called within a tokio runtime.
    pub fn spawn(code: RoomCode, config: &RoomConfig, created_at: u64) -> Self {
        let room = Room::new(code.clone(), config, created_at);
        let (tx, rx) = mpsc::channel(config.command_queue_depth.max(1));
        let handle = Self {
            code,
            created_at,
            participants: room.participant_counter(),
            broadcast: room.broadcast().clone(),
            tx,
        };
        tokio::spawn(run(room, rx));
        handle
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Participants ever joined (they are never removed).
    pub fn participant_count(&self) -> usize {
        self.participants.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.broadcast.subscribe()
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Append a command to the queue. Waits while the queue is full.
    pub async fn enqueue(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RoomError::RoomNotFound(self.code.to_string()))
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> RoomCommand) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(make(reply)).await?;
        rx.await.map_err(|_| {
            RoomError::OperationFailure(format!("command on room {} was aborted", self.code))
        })?
    }

    pub async fn join(&self, connection_id: Uuid, name: impl Into<String>) -> Result<ParticipantStatus, RoomError> {
        let name = name.into();
        self.call(|reply| RoomCommand::Join {
            connection_id,
            name,
            reply,
        })
        .await
    }

    pub async fn heartbeat(&self, connection_id: Uuid) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::Heartbeat {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self, connection_id: Uuid) -> Result<Option<String>, RoomError> {
        self.call(|reply| RoomCommand::Disconnect {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn submit_state(
        &self,
        connection_id: Uuid,
        state: GameState,
        descriptor: Option<ActionDescriptor>,
    ) -> Result<u64, RoomError> {
        self.call(|reply| RoomCommand::SubmitState {
            connection_id,
            state,
            descriptor,
            reply,
        })
        .await
    }

    pub async fn submit_action(
        &self,
        connection_id: Uuid,
        action: Action,
        description: Option<String>,
    ) -> Result<u64, RoomError> {
        self.call(|reply| RoomCommand::SubmitAction {
            connection_id,
            action,
            description,
            reply,
        })
        .await
    }

    pub async fn undo(&self, connection_id: Uuid) -> Result<u64, RoomError> {
        self.call(|reply| RoomCommand::Undo {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn redo(&self, connection_id: Uuid) -> Result<u64, RoomError> {
        self.call(|reply| RoomCommand::Redo {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn reset(&self) -> Result<u64, RoomError> {
        self.call(|reply| RoomCommand::Reset { reply }).await
    }

    pub async fn request_approval(
        &self,
        connection_id: Uuid,
        descriptor: ActionDescriptor,
        approval_id: Option<String>,
    ) -> Result<PendingApproval, RoomError> {
        self.call(|reply| RoomCommand::RequestApproval {
            connection_id,
            descriptor,
            approval_id,
            reply,
        })
        .await
    }

    pub async fn vote(
        &self,
        connection_id: Uuid,
        approval_id: impl Into<String>,
        approve: bool,
    ) -> Result<VoteOutcome, RoomError> {
        let approval_id = approval_id.into();
        self.call(|reply| RoomCommand::Vote {
            connection_id,
            approval_id,
            approve,
            reply,
        })
        .await
    }

    pub async fn trade(
        &self,
        connection_id: Uuid,
        kind: TradeKind,
        to: impl Into<String>,
        trade: Value,
    ) -> Result<(), RoomError> {
        let to = to.into();
        self.call(|reply| RoomCommand::Trade {
            connection_id,
            kind,
            to,
            trade,
            reply,
        })
        .await
    }

    pub async fn summary(&self) -> Result<RoomSummary, RoomError> {
        self.call(|reply| RoomCommand::Summary { reply }).await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, RoomError> {
        self.call(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Ask the actor to stop. Already-closed rooms are fine.
    pub async fn close(&self) {
        let _ = self.tx.send(RoomCommand::Close).await;
    }
}
