//! Candidate pairs

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;
use crate::config::IceRole;
use crate::stun::TransactionId;

/// Pair identifier, allocated in creation order. Used as the final tie-break
/// when ordering pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairId(pub u64);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pair#{}", self.0)
    }
}

/// Candidate pair state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairState {
    /// Not checked yet and not allowed to be
    Frozen,
    /// Ready to be checked
    Waiting,
    /// Check outstanding
    InProgress,
    /// Check succeeded
    Succeeded,
    /// Check failed
    Failed,
}

impl PairState {
    /// Succeeded or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Candidate pair for connectivity checks
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub id: PairId,
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub state: PairState,
    /// Selected for use by the nomination procedure
    pub nominated: bool,
    /// Part of the valid list
    pub valid: bool,
    /// Controlled side: nominate when the outstanding check succeeds
    pub(crate) nominate_on_success: bool,
    /// A 487 has already been answered with a retry
    pub(crate) role_conflict_retried: bool,
    /// Outstanding check transaction
    pub(crate) transaction: Option<TransactionId>,
}

impl CandidatePair {
    pub fn new(id: PairId, local: Candidate, remote: Candidate, role: IceRole) -> Self {
        let priority = Self::compute_priority(local.priority, remote.priority, role);
        Self {
            id,
            local,
            remote,
            priority,
            state: PairState::Frozen,
            nominated: false,
            valid: false,
            nominate_on_success: false,
            role_conflict_retried: false,
            transaction: None,
        }
    }

    /// `2^32 * min(G, D) + 2 * max(G, D) + (G > D ? 1 : 0)` where G is the
    /// controlling agent's candidate priority and D the controlled agent's
    pub fn compute_priority(local_priority: u32, remote_priority: u32, role: IceRole) -> u64 {
        let (g, d) = match role {
            IceRole::Controlling => (local_priority as u64, remote_priority as u64),
            IceRole::Controlled => (remote_priority as u64, local_priority as u64),
        };
        (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
    }

    /// Recompute the priority after a role change
    pub fn update_priority(&mut self, role: IceRole) {
        self.priority = Self::compute_priority(self.local.priority, self.remote.priority, role);
    }

    /// Pair foundation: local and remote foundations joined
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation, self.remote.foundation)
    }

    /// Check-list order: priority descending, then creation order
    pub fn check_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}
