//! Participant presence for one room.
//!
//! Identity is the display name. The connection id is ephemeral: a
//! reconnect under the same name rebinds the existing participant instead
//! of creating a second one. Participants are never removed, only marked
//! disconnected.
//!
//! Online status is derived on read:
//!
//! ```text
//! online  ⇔  connected  ∧  now − last_heartbeat < window   (default 10s)
//! ```
//!
//! Join/reconnect time seeds `last_heartbeat`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::PlayerId;

pub const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(10);

/// A named seat in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Current connection. Replaced on reconnect.
    pub connection_id: Uuid,
    pub name: String,
    /// Player entry bound to this name, once one exists.
    pub player_id: Option<PlayerId>,
    /// Cleared by a transport-level disconnect.
    pub connected: bool,
    pub joined_at: u64,
    pub last_heartbeat: u64,
    pub disconnected_at: Option<u64>,
}

impl Participant {
    fn new(name: String, connection_id: Uuid, now: u64) -> Self {
        Self {
            connection_id,
            name,
            player_id: None,
            connected: true,
            joined_at: now,
            last_heartbeat: now,
            disconnected_at: None,
        }
    }

    pub fn is_online(&self, now: u64, window: Duration) -> bool {
        self.connected && now.saturating_sub(self.last_heartbeat) < window.as_millis() as u64
    }

    pub fn status(&self, now: u64, window: Duration) -> ParticipantStatus {
        ParticipantStatus {
            name: self.name.clone(),
            connection_id: self.connection_id,
            player_id: self.player_id,
            online: self.is_online(now, window),
            joined_at: self.joined_at,
            last_heartbeat: self.last_heartbeat,
            disconnected_at: self.disconnected_at,
        }
    }
}

/// Point-in-time view of a participant, as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub name: String,
    pub connection_id: Uuid,
    pub player_id: Option<PlayerId>,
    pub online: bool,
    pub joined_at: u64,
    pub last_heartbeat: u64,
    pub disconnected_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    New,
    Reconnected,
}

/// Participants of one room in join order.
#[derive(Debug)]
pub struct PresenceTracker {
    participants: Vec<Participant>,
    window: Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ONLINE_WINDOW)
    }
}

impl PresenceTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            participants: Vec::new(),
            window,
        }
    }

    /// Join, or resume the seat held by `name`.
    pub fn join(&mut self, name: &str, connection_id: Uuid, now: u64) -> (JoinKind, &mut Participant) {
        match self.participants.iter().position(|p| p.name == name) {
            Some(index) => {
                let participant = &mut self.participants[index];
                participant.connection_id = connection_id;
                participant.connected = true;
                participant.last_heartbeat = now;
                participant.disconnected_at = None;
                (JoinKind::Reconnected, participant)
            }
            None => {
                self.participants
                    .push(Participant::new(name.to_string(), connection_id, now));
                let index = self.participants.len() - 1;
                (JoinKind::New, &mut self.participants[index])
            }
        }
    }

    /// Record a heartbeat. Returns false for an unknown name.
    pub fn heartbeat(&mut self, name: &str, now: u64) -> bool {
        match self.participants.iter_mut().find(|p| p.name == name) {
            Some(participant) => {
                participant.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Mark the participant currently bound to `connection_id` as disconnected.
    ///
    /// A connection id that was superseded by a reconnect matches nobody.
    pub fn mark_offline(&mut self, connection_id: Uuid, now: u64) -> Option<&Participant> {
        let participant = self
            .participants
            .iter_mut()
            .find(|p| p.connection_id == connection_id && p.connected)?;
        participant.connected = false;
        participant.disconnected_at = Some(now);
        Some(&*participant)
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    pub fn name_of(&self, connection_id: Uuid) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
            .map(|p| p.name.as_str())
    }

    pub fn connection_of(&self, name: &str) -> Option<Uuid> {
        self.get(name).map(|p| p.connection_id)
    }

    /// Player ids currently bound to a participant.
    pub fn bound_players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.participants.iter().filter_map(|p| p.player_id)
    }

    /// Forget every player binding (used when the state is reset).
    pub fn unbind_players(&mut self) {
        for participant in &mut self.participants {
            participant.player_id = None;
        }
    }

    pub fn statuses(&self, now: u64) -> Vec<ParticipantStatus> {
        self.participants
            .iter()
            .map(|p| p.status(now, self.window))
            .collect()
    }

    pub fn online_count(&self, now: u64) -> usize {
        self.participants
            .iter()
            .filter(|p| p.is_online(now, self.window))
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.name.clone()).collect()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
