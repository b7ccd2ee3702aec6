//! Multi-party approvals for sensitive mutations.
//!
//! A request stays pending until the tally crosses a threshold:
//!
//! | Tally | Outcome |
//! |-------|---------|
//! | approvals ≥ 1 | approved |
//! | rejections ≥ 2 | rejected |
//! | otherwise | pending |
//!
//! The thresholds do not depend on how many people are in the room.
//! One connection gets one vote; a second vote from it is ignored.

use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::ActionDescriptor;
use crate::error::StateError;

pub const APPROVALS_TO_PASS: usize = 1;
pub const REJECTIONS_TO_FAIL: usize = 2;

const ID_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// An in-flight vote gating a proposed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub action: ActionDescriptor,
    pub approvals: BTreeSet<Uuid>,
    pub rejections: BTreeSet<Uuid>,
    pub requester: Uuid,
    pub requester_name: String,
    pub room: String,
    pub created_at: u64,
}

impl PendingApproval {
    fn has_voted(&self, voter: &Uuid) -> bool {
        self.approvals.contains(voter) || self.rejections.contains(voter)
    }
}

/// What a vote did to its approval.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// The connection had already voted; nothing changed.
    Ignored,
    Pending { approvals: usize, rejections: usize },
    /// Resolved; the approval has been removed from the coordinator.
    Approved(PendingApproval),
    Rejected(PendingApproval),
}

/// Pending approvals of one room, keyed by approval id.
#[derive(Debug, Default)]
pub struct ApprovalCoordinator {
    pending: HashMap<String, PendingApproval>,
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new approval. A missing id is generated.
    pub fn request(
        &mut self,
        id: Option<String>,
        room: impl Into<String>,
        action: ActionDescriptor,
        requester: Uuid,
        requester_name: impl Into<String>,
        now: u64,
    ) -> Result<&PendingApproval, StateError> {
        let id = match id {
            Some(id) if self.pending.contains_key(&id) => {
                return Err(StateError::DuplicateApproval(id))
            }
            Some(id) => id,
            None => loop {
                let candidate = generate_approval_id(now);
                if !self.pending.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let approval = PendingApproval {
            id: id.clone(),
            action,
            approvals: BTreeSet::new(),
            rejections: BTreeSet::new(),
            requester,
            requester_name: requester_name.into(),
            room: room.into(),
            created_at: now,
        };
        Ok(self.pending.entry(id).or_insert(approval))
    }

    pub fn vote(
        &mut self,
        approval_id: &str,
        voter: Uuid,
        approve: bool,
    ) -> Result<VoteOutcome, StateError> {
        let approval = self
            .pending
            .get_mut(approval_id)
            .ok_or_else(|| StateError::UnknownApproval(approval_id.to_string()))?;

        if approval.has_voted(&voter) {
            return Ok(VoteOutcome::Ignored);
        }
        if approve {
            approval.approvals.insert(voter);
        } else {
            approval.rejections.insert(voter);
        }

        let approvals = approval.approvals.len();
        let rejections = approval.rejections.len();

        if approvals >= APPROVALS_TO_PASS {
            Ok(self
                .pending
                .remove(approval_id)
                .map_or(VoteOutcome::Ignored, VoteOutcome::Approved))
        } else if rejections >= REJECTIONS_TO_FAIL {
            Ok(self
                .pending
                .remove(approval_id)
                .map_or(VoteOutcome::Ignored, VoteOutcome::Rejected))
        } else {
            Ok(VoteOutcome::Pending {
                approvals,
                rejections,
            })
        }
    }

    pub fn get(&self, approval_id: &str) -> Option<&PendingApproval> {
        self.pending.get(approval_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending approval, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

/// `<millis>-<9 base-36 chars>`.
pub fn generate_approval_id(now: u64) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_SUFFIX_ALPHABET[rng.random_range(0..ID_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{now}-{suffix}")
}
