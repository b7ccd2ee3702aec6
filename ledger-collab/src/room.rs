//! One room's authoritative contents and the handlers that mutate them.
//!
//! A `Room` is owned by exactly one sequencer task; nothing here is
//! `async` and nothing takes a lock. Each handler validates, computes the
//! next snapshot, swaps it in, bumps the version and publishes the
//! resulting events on the room's [`BroadcastGroup`].
//!
//! Connections act through the participant they joined as. A connection
//! id that is not the current binding of any participant gets
//! [`RoomError::NotJoined`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ledger_core::{
    Action, ActionDescriptor, ApprovalCoordinator, GameState, History, HistoryStep, JoinKind,
    LogEntry, Money, ParticipantStatus, PendingApproval, PlayerEntry, PlayerId, PresenceTracker,
    VoteOutcome,
};
use serde_json::Value;
use uuid::Uuid;

use crate::broadcast::{Audience, BroadcastGroup};
use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::protocol::{RoomSnapshot, RoomSummary, ServerEvent, SyncMessage};
use crate::room_id::RoomCode;

/// Which leg of a trade negotiation is being relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Propose,
    Accept,
    Reject,
}

pub struct Room {
    code: RoomCode,
    created_at: u64,
    state: Arc<GameState>,
    history: History,
    approvals: ApprovalCoordinator,
    presence: PresenceTracker,
    version: u64,
    broadcast: Arc<BroadcastGroup>,
    /// Mirrors `presence.len()` for readers outside the actor.
    participant_count: Arc<AtomicUsize>,
}

impl Room {
    pub fn new(code: RoomCode, config: &RoomConfig, created_at: u64) -> Self {
        Self {
            code,
            created_at,
            state: Arc::new(GameState::new()),
            history: History::new(config.history_limit),
            approvals: ApprovalCoordinator::new(),
            presence: PresenceTracker::new(config.presence_window),
            version: 0,
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            participant_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn state(&self) -> &Arc<GameState> {
        &self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn participant_counter(&self) -> Arc<AtomicUsize> {
        self.participant_count.clone()
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Join as `name`, or reconnect the participant already holding it.
    ///
    /// The first time a name is seen without a matching player entry, an
    /// entry with the starting purse is created.
    pub fn join(&mut self, connection_id: Uuid, name: &str, now: u64) -> Result<ParticipantStatus, RoomError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoomError::InvalidState("participant name must not be empty".into()));
        }

        let player_id = self.ensure_player(name);
        let window = self.presence.window();
        let (kind, participant) = self.presence.join(name, connection_id, now);
        participant.player_id = Some(player_id);
        let status = participant.status(now, window);
        let reconnected = kind == JoinKind::Reconnected;
        self.participant_count.store(self.presence.len(), Ordering::Release);

        if reconnected {
            log::info!("Room {}: {} reconnected ({})", self.code, name, connection_id);
        } else {
            log::info!("Room {}: {} joined as player {}", self.code, name, player_id);
        }

        self.publish(ServerEvent::ParticipantJoined {
            participant: status.clone(),
            reconnected,
            participants: self.presence.statuses(now),
        });
        self.publish_state();
        self.publish_logs();
        Ok(status)
    }

    fn ensure_player(&mut self, name: &str) -> PlayerId {
        if let Some(existing) = self.state.player_by_name(name) {
            return existing.id;
        }
        let mut next = (*self.state).clone();
        let id = next.add_player(name, Money::starting_purse());
        self.replace_state(Arc::new(next));
        id
    }

    pub fn heartbeat(&mut self, connection_id: Uuid, now: u64) -> Result<(), RoomError> {
        let name = self.actor_name(connection_id)?;
        self.presence.heartbeat(&name, now);
        self.publish(ServerEvent::Presence {
            participants: self.presence.statuses(now),
        });
        Ok(())
    }

    /// Transport-level disconnect. A superseded connection id is ignored.
    pub fn disconnect(&mut self, connection_id: Uuid, now: u64) -> Option<String> {
        let name = self
            .presence
            .mark_offline(connection_id, now)
            .map(|p| p.name.clone());
        match &name {
            Some(name) => {
                log::info!("Room {}: {} disconnected", self.code, name);
                self.publish(ServerEvent::ParticipantLeft {
                    name: name.clone(),
                    participants: self.presence.statuses(now),
                });
            }
            None => log::debug!("Room {}: stale disconnect from {}", self.code, connection_id),
        }
        name
    }

    // ─── State mutations ──────────────────────────────────────────────

    /// Merge a partial or complete state. Logged only when described.
    pub fn submit_state(
        &mut self,
        connection_id: Uuid,
        incoming: &GameState,
        descriptor: Option<ActionDescriptor>,
        now: u64,
    ) -> Result<u64, RoomError> {
        let actor = self.actor_name(connection_id)?;
        let before = self.state.clone();
        let after = Arc::new(before.merged(incoming));

        if let Some(descriptor) = descriptor {
            let action_type = if descriptor.kind.is_empty() {
                "state_merge".to_string()
            } else {
                descriptor.kind.clone()
            };
            let description = if descriptor.description.is_empty() {
                format!("state updated ({} player entries)", incoming.player_count())
            } else {
                descriptor.description.clone()
            };
            let payload = serde_json::to_value(&descriptor).unwrap_or(Value::Null);
            self.history.append(
                LogEntry::new(action_type, description, actor, now)
                    .with_payload(payload)
                    .with_snapshots(before, after.clone()),
            );
            self.replace_state(after);
            self.publish_state();
            self.publish_logs();
        } else {
            self.replace_state(after);
            self.publish_state();
        }
        Ok(self.version)
    }

    pub fn submit_action(
        &mut self,
        connection_id: Uuid,
        action: &Action,
        description: Option<String>,
        now: u64,
    ) -> Result<u64, RoomError> {
        let actor = self.actor_name(connection_id)?;
        self.apply_action(&actor, action, description, now)
    }

    /// Apply `action` on behalf of `actor`, log it and publish.
    fn apply_action(
        &mut self,
        actor: &str,
        action: &Action,
        description: Option<String>,
        now: u64,
    ) -> Result<u64, RoomError> {
        let before = self.state.clone();
        let after = Arc::new(before.apply(action)?);
        let description = description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| action.describe(&before));
        let payload = serde_json::to_value(action).unwrap_or(Value::Null);

        log::debug!("Room {}: {} applied {}", self.code, actor, action.type_tag());
        self.history.append(
            LogEntry::new(action.type_tag(), description, actor, now)
                .with_payload(payload)
                .with_snapshots(before, after.clone()),
        );
        self.replace_state(after);
        self.publish_state();
        self.publish_logs();
        Ok(self.version)
    }

    pub fn undo(&mut self, connection_id: Uuid) -> Result<u64, RoomError> {
        self.actor_name(connection_id)?;
        let step = self.history.undo();
        self.finish_step(step, "undo");
        Ok(self.version)
    }

    pub fn redo(&mut self, connection_id: Uuid) -> Result<u64, RoomError> {
        self.actor_name(connection_id)?;
        let step = self.history.redo();
        self.finish_step(step, "redo");
        Ok(self.version)
    }

    fn finish_step(&mut self, step: HistoryStep, op: &str) {
        match step {
            HistoryStep::Empty => {}
            HistoryStep::Discarded(id) => {
                log::debug!("Room {}: {op} discarded entry {id} without snapshot", self.code);
                self.publish_logs();
            }
            HistoryStep::Applied(snapshot) => {
                let snapshot = self.keep_bound_players(snapshot);
                self.replace_state(snapshot);
                self.publish_state();
                self.publish_logs();
            }
        }
    }

    /// Snapshots predate later joins. Carry over every entry a participant
    /// is bound to so undo and redo never delete a seated player.
    fn keep_bound_players(&self, snapshot: Arc<GameState>) -> Arc<GameState> {
        let missing: Vec<PlayerEntry> = self
            .presence
            .bound_players()
            .filter(|id| snapshot.player(*id).is_none())
            .filter_map(|id| self.state.player(id).cloned())
            .collect();
        if missing.is_empty() {
            return snapshot;
        }
        let mut restored = (*snapshot).clone();
        for entry in missing {
            log::debug!("Room {}: keeping player {} across history step", self.code, entry.id);
            restored.insert_player(entry);
        }
        Arc::new(restored)
    }

    /// Empty the state and both logs. Participants stay; pending
    /// approvals are dropped.
    pub fn reset(&mut self) -> u64 {
        self.history.clear();
        let dropped = self.approvals.clear();
        self.presence.unbind_players();
        self.replace_state(Arc::new(GameState::new()));
        log::info!(
            "Room {} reset ({} pending approvals discarded)",
            self.code,
            dropped
        );

        self.publish(ServerEvent::RoomReset {
            room: self.code.to_string(),
        });
        self.publish_state();
        self.publish_logs();
        self.version
    }

    /// Tell members the room is going away.
    pub fn close(&self) {
        self.publish(ServerEvent::RoomDeleted {
            room: self.code.to_string(),
        });
    }

    // ─── Approvals ────────────────────────────────────────────────────

    pub fn request_approval(
        &mut self,
        connection_id: Uuid,
        descriptor: ActionDescriptor,
        approval_id: Option<String>,
        now: u64,
    ) -> Result<PendingApproval, RoomError> {
        let requester_name = self.actor_name(connection_id)?;
        let approval = self
            .approvals
            .request(
                approval_id,
                self.code.as_str(),
                descriptor,
                connection_id,
                requester_name,
                now,
            )?
            .clone();

        log::info!(
            "Room {}: approval {} requested by {}",
            self.code,
            approval.id,
            approval.requester_name
        );
        self.publish(ServerEvent::ApprovalRequested {
            approval: approval.clone(),
        });
        Ok(approval)
    }

    /// Record a vote. An approved descriptor carrying a typed action is
    /// applied as the requester.
    pub fn vote(
        &mut self,
        connection_id: Uuid,
        approval_id: &str,
        approve: bool,
        now: u64,
    ) -> Result<VoteOutcome, RoomError> {
        self.actor_name(connection_id)?;
        let outcome = self.approvals.vote(approval_id, connection_id, approve)?;

        match &outcome {
            VoteOutcome::Ignored => {
                log::debug!("Room {}: repeated vote on {approval_id} ignored", self.code);
            }
            VoteOutcome::Pending {
                approvals,
                rejections,
            } => {
                self.publish(ServerEvent::ApprovalUpdated {
                    approval_id: approval_id.to_string(),
                    approvals: *approvals,
                    rejections: *rejections,
                });
            }
            VoteOutcome::Approved(approval) => {
                log::info!("Room {}: approval {} passed", self.code, approval.id);
                self.publish(ServerEvent::ActionApproved {
                    approval: approval.clone(),
                });
                if let Some(action) = &approval.action.action {
                    let description = Some(approval.action.description.clone());
                    if let Err(e) =
                        self.apply_action(&approval.requester_name, action, description, now)
                    {
                        log::warn!(
                            "Room {}: approved action {} could not be applied: {e}",
                            self.code,
                            approval.id
                        );
                        self.publish_to(
                            Audience::Connection(approval.requester),
                            ServerEvent::Error {
                                code: e.code(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
            }
            VoteOutcome::Rejected(approval) => {
                log::info!("Room {}: approval {} rejected", self.code, approval.id);
                self.publish(ServerEvent::ActionRejected {
                    approval: approval.clone(),
                });
            }
        }
        Ok(outcome)
    }

    // ─── Trades ───────────────────────────────────────────────────────

    /// Relay a trade message to the counterpart's current connection.
    pub fn trade(
        &mut self,
        connection_id: Uuid,
        kind: TradeKind,
        to: &str,
        trade: Value,
    ) -> Result<(), RoomError> {
        let from = self.actor_name(connection_id)?;
        let target = self
            .presence
            .connection_of(to)
            .ok_or_else(|| RoomError::UnknownParticipant(to.to_string()))?;

        let event = match kind {
            TradeKind::Propose => ServerEvent::TradeProposed { from, trade },
            TradeKind::Accept => ServerEvent::TradeAccepted { from, trade },
            TradeKind::Reject => ServerEvent::TradeRejected { from, trade },
        };
        self.publish_to(Audience::Connection(target), event);
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn summary(&self, now: u64) -> RoomSummary {
        RoomSummary {
            room: self.code.to_string(),
            created_at: self.created_at,
            version: self.version,
            online_count: self.presence.online_count(now),
            participants: self.presence.statuses(now),
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room: self.code.to_string(),
            state: (*self.state).clone(),
            action_log: self.history.action_log().to_vec(),
            redo_log: self.history.redo_log().to_vec(),
            version: self.version,
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn actor_name(&self, connection_id: Uuid) -> Result<String, RoomError> {
        self.presence
            .name_of(connection_id)
            .map(str::to_string)
            .ok_or_else(|| RoomError::NotJoined(self.code.to_string()))
    }

    fn replace_state(&mut self, next: Arc<GameState>) {
        self.state = next;
        self.version += 1;
    }

    fn publish_state(&self) {
        self.publish(ServerEvent::StateUpdated {
            state: (*self.state).clone(),
            version: self.version,
        });
    }

    fn publish_logs(&self) {
        self.publish(ServerEvent::LogsUpdated {
            action_log: self.history.action_log().to_vec(),
            redo_log: self.history.redo_log().to_vec(),
        });
    }

    fn publish(&self, event: ServerEvent) {
        self.publish_to(Audience::Room, event);
    }

    fn publish_to(&self, audience: Audience, event: ServerEvent) {
        let result = SyncMessage::event(self.code.as_str(), self.version, &event)
            .and_then(|msg| self.broadcast.publish(audience, &msg));
        if let Err(e) = result {
            log::warn!("Room {}: failed to publish event: {e}", self.code);
        }
    }
}
