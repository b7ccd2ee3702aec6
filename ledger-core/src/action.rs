//! Structured mutations.
//!
//! The set is closed: every variant has its own payload shape and is
//! validated by serde before it reaches a room. Clients tag the variant
//! with `kind`:
//!
//! ```json
//! { "kind": "adjust_money", "player": 2, "direction": "credit", "amounts": { "500": 1 } }
//! { "kind": "transfer_property", "property": "boardwalk", "from": 1, "to": 2 }
//! { "kind": "merge_state", "state": { "players": { "3": { "name": "Carol" } } } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{GameState, Money, PlayerId};

/// Whether an adjustment adds to or removes from a purse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Credit,
    Debit,
}

/// A typed mutation of the game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Add or subtract per-denomination counts for one player.
    AdjustMoney {
        player: PlayerId,
        #[serde(default)]
        direction: Direction,
        amounts: Money,
    },
    /// Move a property id from one player's list to the end of another's.
    TransferProperty {
        property: String,
        from: PlayerId,
        to: PlayerId,
    },
    /// Whole-state merge expressed as an action, so it can be gated by an approval.
    MergeState { state: GameState },
}

impl Action {
    /// Type tag recorded in the action log.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Action::AdjustMoney {
                direction: Direction::Credit,
                ..
            } => "money_credit",
            Action::AdjustMoney {
                direction: Direction::Debit,
                ..
            } => "money_debit",
            Action::TransferProperty { .. } => "property_transfer",
            Action::MergeState { .. } => "state_merge",
        }
    }

    /// Human-readable description, resolving player ids against `state`.
    pub fn describe(&self, state: &GameState) -> String {
        let name = |id: &PlayerId| {
            state
                .player(*id)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("player {id}"))
        };

        match self {
            Action::AdjustMoney {
                player,
                direction,
                amounts,
            } => {
                let verb = match direction {
                    Direction::Credit => "received",
                    Direction::Debit => "paid",
                };
                format!("{} {verb} {} ({amounts})", name(player), amounts.total())
            }
            Action::TransferProperty { property, from, to } => {
                format!("{property} moved from {} to {}", name(from), name(to))
            }
            Action::MergeState { state: incoming } => {
                format!("state updated ({} player entries)", incoming.player_count())
            }
        }
    }
}

/// Client-supplied description of a mutation.
///
/// Mostly opaque: `kind` and `description` are logged, `data` is carried
/// through untouched. When `action` is present the room can apply it
/// itself, e.g. once an approval passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ActionDescriptor {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            action: None,
            data: Value::Null,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
