//! Action log and redo stack.
//!
//! ```text
//!   append ──► [ e1 e2 e3 ]  action log        redo stack  [ ]
//!   undo   ──► [ e1 e2 ]     state := e3.before            [ e3 ]
//!   redo   ──► [ e1 e2 e3 ]  state := e3.after             [ ]
//! ```
//!
//! Entries carry `Arc<GameState>` snapshots, so undo and redo swap a
//! pointer rather than copying a state. Appending a fresh entry empties
//! the redo stack.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::GameState;

/// Default number of entries kept in the action log.
pub const DEFAULT_LOG_LIMIT: usize = 500;

/// One applied mutation.
///
/// Snapshots stay server-side: they are skipped when an entry is sent to
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub action_type: String,
    pub description: String,
    pub actor: String,
    #[serde(default)]
    pub payload: Value,
    /// State before the action. Required for undo.
    #[serde(skip)]
    pub before: Option<Arc<GameState>>,
    /// State after the action. Required for redo.
    #[serde(skip)]
    pub after: Option<Arc<GameState>>,
}

impl LogEntry {
    pub fn new(
        action_type: impl Into<String>,
        description: impl Into<String>,
        actor: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: 0,
            timestamp,
            action_type: action_type.into(),
            description: description.into(),
            actor: actor.into(),
            payload: Value::Null,
            before: None,
            after: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_snapshots(mut self, before: Arc<GameState>, after: Arc<GameState>) -> Self {
        self.before = Some(before);
        self.after = Some(after);
        self
    }

    pub fn can_undo(&self) -> bool {
        self.before.is_some()
    }

    pub fn can_redo(&self) -> bool {
        self.after.is_some()
    }
}

/// Result of an undo or redo.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStep {
    /// Nothing to undo/redo.
    Empty,
    /// The popped entry had no usable snapshot and was dropped.
    Discarded(u64),
    /// The room state must become this snapshot.
    Applied(Arc<GameState>),
}

impl HistoryStep {
    pub fn changed_history(&self) -> bool {
        !matches!(self, HistoryStep::Empty)
    }
}

#[derive(Debug)]
pub struct History {
    log: Vec<LogEntry>,
    redo: Vec<LogEntry>,
    next_id: u64,
    limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LIMIT)
    }
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            log: Vec::new(),
            redo: Vec::new(),
            next_id: 1,
            limit: limit.max(1),
        }
    }

    /// Push a new entry and invalidate the redo stack. Returns the entry id.
    pub fn append(&mut self, mut entry: LogEntry) -> u64 {
        entry.id = self.next_id;
        self.next_id += 1;
        let id = entry.id;

        self.log.push(entry);
        self.redo.clear();

        if self.log.len() > self.limit {
            let excess = self.log.len() - self.limit;
            self.log.drain(..excess);
            log::debug!("action log trimmed by {excess} entries");
        }
        id
    }

    pub fn undo(&mut self) -> HistoryStep {
        let Some(entry) = self.log.pop() else {
            return HistoryStep::Empty;
        };
        match entry.before.clone() {
            Some(before) => {
                self.redo.push(entry);
                HistoryStep::Applied(before)
            }
            None => HistoryStep::Discarded(entry.id),
        }
    }

    pub fn redo(&mut self) -> HistoryStep {
        let Some(entry) = self.redo.pop() else {
            return HistoryStep::Empty;
        };
        match entry.after.clone() {
            Some(after) => {
                self.log.push(entry);
                HistoryStep::Applied(after)
            }
            None => HistoryStep::Discarded(entry.id),
        }
    }

    pub fn clear(&mut self) {
        self.log.clear();
        self.redo.clear();
    }

    /// Oldest first.
    pub fn action_log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Most recently undone last.
    pub fn redo_log(&self) -> &[LogEntry] {
        &self.redo
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Direction};
    use crate::state::Money;

    fn credit(player: u32) -> Action {
        Action::AdjustMoney {
            player,
            direction: Direction::Credit,
            amounts: Money::from_counts([("100", 1)]),
        }
    }

    /// Apply `action` to `state`, log it, and return the new state.
    fn record(history: &mut History, state: Arc<GameState>, action: &Action) -> Arc<GameState> {
        let next = Arc::new(state.apply(action).unwrap());
        let entry = LogEntry::new(action.type_tag(), action.describe(&state), "Alice", 0)
            .with_snapshots(state, next.clone());
        history.append(entry);
        next
    }

    fn seeded() -> Arc<GameState> {
        let mut state = GameState::new();
        state.add_player("Alice", Money::starting_purse());
        state.add_player("Bob", Money::starting_purse());
        Arc::new(state)
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let mut history = History::default();
        let a = history.append(LogEntry::new("x", "first", "Alice", 1));
        let b = history.append(LogEntry::new("x", "second", "Bob", 2));
        assert_eq!((a, b), (1, 2));
        assert_eq!(history.action_log()[1].description, "second");
    }

    #[test]
    fn test_undo_empty_is_noop() {
        let mut history = History::default();
        assert_eq!(history.undo(), HistoryStep::Empty);
        assert_eq!(history.redo(), HistoryStep::Empty);
    }

    #[test]
    fn test_undo_without_snapshot_discards_entry() {
        let mut history = History::default();
        let id = history.append(LogEntry::new("note", "no snapshot", "Alice", 0));

        assert_eq!(history.undo(), HistoryStep::Discarded(id));
        assert!(history.is_empty());
        assert!(history.redo_log().is_empty());
    }

    #[test]
    fn test_redo_without_after_snapshot_discards_entry() {
        let mut history = History::default();
        let mut entry = LogEntry::new("x", "before only", "Alice", 0);
        entry.before = Some(Arc::new(GameState::new()));
        let id = history.append(entry);

        assert!(matches!(history.undo(), HistoryStep::Applied(_)));
        assert_eq!(history.redo(), HistoryStep::Discarded(id));
        assert!(history.is_empty());
        assert!(history.redo_log().is_empty());
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut history = History::default();
        let initial = seeded();

        let mut state = initial.clone();
        for player in [1, 2, 2, 1, 2] {
            state = record(&mut history, state, &credit(player));
        }
        let after_actions = state.clone();

        for _ in 0..5 {
            match history.undo() {
                HistoryStep::Applied(snapshot) => state = snapshot,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(*state, *initial);
        assert_eq!(history.redo_log().len(), 5);

        for _ in 0..5 {
            match history.redo() {
                HistoryStep::Applied(snapshot) => state = snapshot,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(*state, *after_actions);
        assert!(Arc::ptr_eq(&state, &after_actions));
        assert_eq!(history.len(), 5);
        assert!(history.redo_log().is_empty());
    }

    #[test]
    fn test_new_action_clears_redo() {
        let mut history = History::default();
        let state = record(&mut history, seeded(), &credit(1));
        let state = record(&mut history, state, &credit(2));

        let HistoryStep::Applied(state) = history.undo() else {
            panic!("expected undo to apply");
        };
        assert_eq!(history.redo_log().len(), 1);

        record(&mut history, state, &credit(1));
        assert!(history.redo_log().is_empty());
        assert_eq!(history.redo(), HistoryStep::Empty);
    }

    #[test]
    fn test_log_limit_drops_oldest() {
        let mut history = History::new(3);
        for n in 0..5 {
            history.append(LogEntry::new("x", format!("entry {n}"), "Alice", n));
        }
        let descriptions: Vec<&str> = history
            .action_log()
            .iter()
            .map(|e| e.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn test_snapshots_not_serialized() {
        let mut history = History::default();
        record(&mut history, seeded(), &credit(1));
        let value = serde_json::to_value(history.action_log()).unwrap();
        let entry = &value[0];
        assert_eq!(entry["action_type"], "money_credit");
        assert!(entry.get("before").is_none());
        assert!(entry.get("after").is_none());
    }
}
