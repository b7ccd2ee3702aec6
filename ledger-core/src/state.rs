//! Authoritative game state and the merge/apply rules.
//!
//! ```text
//! GameState ─┬─ players: BTreeMap<PlayerId, Arc<PlayerEntry>>
//!            └─ fields:  BTreeMap<String, Arc<Value>>   (opaque top-level keys)
//! ```
//!
//! Every value is reference-counted, so cloning a `GameState` copies two
//! tree spines and bumps refcounts. A mutation clones only the player entry
//! it touches (`Arc::make_mut`); untouched entries stay shared with the
//! previous snapshot. Undo/redo snapshots are plain `Arc<GameState>` captures.
//!
//! On the wire the state is a single JSON object: `players` maps the
//! decimal player id to an entry, every other key is carried verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{Action, Direction};
use crate::error::StateError;

/// Numeric id of a player entry. Independent of the participant's connection.
pub type PlayerId = u32;

/// The one structurally significant top-level key.
pub const PLAYERS_KEY: &str = "players";

/// Standard purse handed to every new player (denomination, count).
const STARTING_PURSE: [(&str, i64); 7] = [
    ("500", 2),
    ("100", 2),
    ("50", 2),
    ("20", 6),
    ("10", 5),
    ("5", 5),
    ("1", 5),
];

// ───────────────────────────────────────────────────────────────────
// Money
// ───────────────────────────────────────────────────────────────────

/// Money held as a count per denomination.
///
/// Counts are signed: debiting more notes than a player holds leaves a
/// negative count. Callers decide whether that is acceptable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(BTreeMap<String, i64>);

impl Money {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed allocation given to a newly recognised player (1500 total).
    pub fn starting_purse() -> Self {
        Self::from_counts(STARTING_PURSE)
    }

    pub fn from_counts<'a>(counts: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        Self(
            counts
                .into_iter()
                .map(|(denomination, count)| (denomination.to_string(), count))
                .collect(),
        )
    }

    /// Count for a denomination; absent denominations count as zero.
    pub fn count(&self, denomination: &str) -> i64 {
        self.0.get(denomination).copied().unwrap_or(0)
    }

    pub fn credit(&mut self, amounts: &Money) {
        for (denomination, count) in &amounts.0 {
            let slot = self.0.entry(denomination.clone()).or_insert(0);
            *slot = slot.saturating_add(*count);
        }
    }

    pub fn debit(&mut self, amounts: &Money) {
        for (denomination, count) in &amounts.0 {
            let slot = self.0.entry(denomination.clone()).or_insert(0);
            *slot = slot.saturating_sub(*count);
        }
    }

    /// Face value of the holding. Non-numeric denominations contribute nothing.
    pub fn total(&self) -> i64 {
        self.0
            .iter()
            .filter_map(|(denomination, count)| {
                denomination
                    .parse::<i64>()
                    .ok()
                    .map(|value| value.saturating_mul(*count))
            })
            .fold(0i64, i64::saturating_add)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(d, c)| (d.as_str(), *c))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (denomination, count) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{count}x{denomination}")?;
            first = false;
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Player entries
// ───────────────────────────────────────────────────────────────────

/// In-game identity tied to a participant name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    /// Taken from the `players` map key when deserialized as part of a state.
    #[serde(default)]
    pub id: PlayerId,
    pub name: String,
    /// Board position.
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub bankrupt: bool,
    #[serde(default)]
    pub money: Money,
    /// Owned property identifiers, in acquisition order.
    #[serde(default)]
    pub properties: Vec<String>,
    /// Any further client-defined fields, carried verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PlayerEntry {
    pub fn new(id: PlayerId, name: impl Into<String>, money: Money) -> Self {
        Self {
            id,
            name: name.into(),
            position: 0,
            bankrupt: false,
            money,
            properties: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn owns(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }
}

// ───────────────────────────────────────────────────────────────────
// Game state
// ───────────────────────────────────────────────────────────────────

/// The authoritative value shared by everyone in a room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameState {
    players: BTreeMap<PlayerId, Arc<PlayerEntry>>,
    fields: BTreeMap<String, Arc<Value>>,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON document. The document must be an object.
    pub fn from_value(value: Value) -> Result<Self, StateError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(StateError::InvalidState(format!(
                "expected an object, got {}",
                value_kind(&other)
            ))),
        }
    }

    fn from_map(mut map: Map<String, Value>) -> Result<Self, StateError> {
        let mut players = BTreeMap::new();
        match map.remove(PLAYERS_KEY) {
            None | Some(Value::Null) => {}
            Some(Value::Object(entries)) => {
                for (key, raw) in entries {
                    let id: PlayerId = key.parse().map_err(|_| StateError::InvalidPlayer {
                        key: key.clone(),
                        reason: "key is not a numeric player id".to_string(),
                    })?;
                    let mut entry: PlayerEntry =
                        serde_json::from_value(raw).map_err(|e| StateError::InvalidPlayer {
                            key: key.clone(),
                            reason: e.to_string(),
                        })?;
                    entry.id = id;
                    players.insert(id, Arc::new(entry));
                }
            }
            Some(other) => {
                return Err(StateError::InvalidState(format!(
                    "`{PLAYERS_KEY}` must be an object, got {}",
                    value_kind(&other)
                )))
            }
        }

        let fields = map
            .into_iter()
            .map(|(key, value)| (key, Arc::new(value)))
            .collect();

        Ok(Self { players, fields })
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.fields.is_empty()
    }

    pub fn player(&self, id: PlayerId) -> Option<&PlayerEntry> {
        self.players.get(&id).map(Arc::as_ref)
    }

    pub fn player_by_name(&self, name: &str) -> Option<&PlayerEntry> {
        self.players
            .values()
            .map(Arc::as_ref)
            .find(|entry| entry.name == name)
    }

    /// Player entries ordered by id.
    pub fn players(&self) -> impl Iterator<Item = &PlayerEntry> {
        self.players.values().map(Arc::as_ref)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).map(Arc::as_ref)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug_assert_ne!(key, PLAYERS_KEY);
        self.fields.insert(key, Arc::new(value));
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set_field(key, value);
        self
    }

    /// Insert or overwrite a player entry under its own id.
    pub fn insert_player(&mut self, entry: PlayerEntry) {
        self.players.insert(entry.id, Arc::new(entry));
    }

    pub fn with_player(mut self, entry: PlayerEntry) -> Self {
        self.insert_player(entry);
        self
    }

    pub fn next_player_id(&self) -> PlayerId {
        self.players
            .last_key_value()
            .map(|(id, _)| id.saturating_add(1))
            .unwrap_or(1)
    }

    /// Create a fresh entry for `name` with the given purse and return its id.
    pub fn add_player(&mut self, name: impl Into<String>, money: Money) -> PlayerId {
        let id = self.next_player_id();
        self.insert_player(PlayerEntry::new(id, name, money));
        id
    }

    /// Overlay `incoming` onto this state.
    ///
    /// Top-level keys are replaced wholesale. `players` is merged per entry:
    /// entries present in `incoming` are inserted or overwritten, entries only
    /// present here are kept. Omission never deletes a player.
    pub fn merged(&self, incoming: &GameState) -> GameState {
        let mut next = self.clone();
        for (key, value) in &incoming.fields {
            next.fields.insert(key.clone(), Arc::clone(value));
        }
        for (id, entry) in &incoming.players {
            next.players.insert(*id, Arc::clone(entry));
        }
        next
    }

    /// Apply a structured action, producing the next state.
    pub fn apply(&self, action: &Action) -> Result<GameState, StateError> {
        match action {
            Action::AdjustMoney {
                player,
                direction,
                amounts,
            } => {
                let mut next = self.clone();
                let slot = next
                    .players
                    .get_mut(player)
                    .ok_or(StateError::UnknownPlayer(*player))?;
                let entry = Arc::make_mut(slot);
                match direction {
                    Direction::Credit => entry.money.credit(amounts),
                    Direction::Debit => entry.money.debit(amounts),
                }
                Ok(next)
            }

            Action::TransferProperty { property, from, to } => {
                let source = self.player(*from).ok_or(StateError::UnknownPlayer(*from))?;
                if self.player(*to).is_none() {
                    return Err(StateError::UnknownPlayer(*to));
                }
                let Some(index) = source.properties.iter().position(|p| p == property) else {
                    return Ok(self.clone());
                };

                let mut next = self.clone();
                if let Some(slot) = next.players.get_mut(from) {
                    Arc::make_mut(slot).properties.remove(index);
                }
                if let Some(slot) = next.players.get_mut(to) {
                    Arc::make_mut(slot).properties.push(property.clone());
                }
                Ok(next)
            }

            Action::MergeState { state } => Ok(self.merged(state)),
        }
    }
}

impl Serialize for GameState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry(PLAYERS_KEY, &self.players)?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value.as_ref())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for GameState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Self::from_map(map).map_err(de::Error::custom)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
