//! Per-component check list
//!
//! Pairs are kept sorted in check order (priority descending, creation order
//! ascending). Pairs are added as candidates appear and are never regenerated.
//! Triggered checks wait in a FIFO that is served before ordinary checks.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::candidate::Candidate;
use crate::config::IceRole;
use crate::pair::{CandidatePair, PairId, PairState};

/// Check list of one component
#[derive(Debug, Default)]
pub struct Checklist {
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<TriggeredCheck>,
}

/// A check scheduled ahead of the ordinary queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggeredCheck {
    pub pair: PairId,
    /// Carry USE-CANDIDATE
    pub nominate: bool,
}

impl Checklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs in check order
    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn get(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.id == id)
    }

    /// Pair with the given local and remote transport addresses
    pub fn find(&self, local: SocketAddr, remote: SocketAddr) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.local.address == local && p.remote.address == remote)
    }

    /// Insert a pair unless one with the same addresses exists.
    /// Returns false for a duplicate.
    pub fn insert(&mut self, pair: CandidatePair) -> bool {
        if self.find(pair.local.address, pair.remote.address).is_some() {
            return false;
        }
        self.pairs.push(pair);
        self.sort();
        true
    }

    fn sort(&mut self) {
        self.pairs.sort_by(|a, b| a.check_order(b));
    }

    /// Recompute every pair priority for a new role and re-sort
    pub fn update_priorities(&mut self, role: IceRole) {
        for pair in &mut self.pairs {
            pair.update_priority(role);
        }
        self.sort();
    }

    /// Whether a pair of the foundation is Waiting or InProgress
    pub fn foundation_active(&self, foundation: &str) -> bool {
        self.pairs.iter().any(|p| {
            matches!(p.state, PairState::Waiting | PairState::InProgress) && p.foundation() == foundation
        })
    }

    /// Keep the Waiting pair of a group that has not started its checks on
    /// the group's highest-priority pair
    pub fn rebalance_waiting(&mut self, foundation: &str) {
        let group = |p: &CandidatePair| p.foundation() == foundation;
        let started = self
            .pairs
            .iter()
            .any(|p| group(p) && !matches!(p.state, PairState::Frozen | PairState::Waiting));
        if started {
            return;
        }
        let mut waiting = self
            .pairs
            .iter()
            .filter(|&p| group(p) && p.state == PairState::Waiting)
            .map(|p| p.id);
        let (Some(current), None) = (waiting.next(), waiting.next()) else {
            return;
        };
        let Some(best) = self.pairs.iter().find(|&p| group(p)).map(|p| p.id) else {
            return;
        };
        if best == current {
            return;
        }
        for pair in &mut self.pairs {
            if pair.id == current {
                pair.state = PairState::Frozen;
            } else if pair.id == best {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// Replace the remote candidate of every pair using its address and
    /// re-sort. Returns the number of pairs updated.
    pub fn update_remote(&mut self, remote: &Candidate, role: IceRole) -> usize {
        let mut updated = 0;
        for pair in self.pairs.iter_mut().filter(|p| p.remote.address == remote.address) {
            pair.remote = remote.clone();
            pair.update_priority(role);
            updated += 1;
        }
        if updated > 0 {
            self.sort();
        }
        updated
    }

    /// Move every Frozen pair of the foundation to Waiting
    pub fn unfreeze_foundation(&mut self, foundation: &str) -> usize {
        let mut count = 0;
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && pair.foundation() == foundation {
                pair.state = PairState::Waiting;
                count += 1;
            }
        }
        count
    }

    /// Move the highest-priority Frozen pair of the foundation to Waiting,
    /// unless another pair of the group is already Waiting or InProgress
    pub fn unfreeze_next_in_group(&mut self, foundation: &str) -> Option<PairId> {
        if self.foundation_active(foundation) {
            return None;
        }
        let pair = self
            .pairs
            .iter_mut()
            .find(|p| p.state == PairState::Frozen && p.foundation() == foundation)?;
        pair.state = PairState::Waiting;
        Some(pair.id)
    }

    /// Next ordinary check: the highest-priority Waiting pair, otherwise the
    /// highest-priority Frozen pair whose foundation has nothing Waiting or
    /// InProgress
    pub fn next_ordinary(&self) -> Option<PairId> {
        if let Some(pair) = self.pairs.iter().find(|p| p.state == PairState::Waiting) {
            return Some(pair.id);
        }
        self.pairs
            .iter()
            .filter(|p| p.state == PairState::Frozen)
            .find(|p| !self.foundation_active(&p.foundation()))
            .map(|p| p.id)
    }

    /// Queue a triggered check. A pair is queued at most once; a nominating
    /// request upgrades an existing entry.
    pub fn push_triggered(&mut self, check: TriggeredCheck) {
        if let Some(existing) = self.triggered.iter_mut().find(|t| t.pair == check.pair) {
            existing.nominate |= check.nominate;
            return;
        }
        self.triggered.push_back(check);
    }

    pub fn pop_triggered(&mut self) -> Option<TriggeredCheck> {
        self.triggered.pop_front()
    }

    pub fn has_triggered(&self) -> bool {
        !self.triggered.is_empty()
    }

    /// Highest-priority valid pair
    pub fn best_valid(&self) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.valid)
    }

    /// Whether a pair with a higher priority than `priority` may still succeed
    pub fn has_outstanding_above(&self, priority: u64) -> bool {
        self.pairs.iter().any(|p| {
            p.priority > priority
                && matches!(p.state, PairState::Frozen | PairState::Waiting | PairState::InProgress)
        })
    }

    /// Every pair has finished its checks
    pub fn all_terminal(&self) -> bool {
        self.pairs.iter().all(|p| p.state.is_terminal())
    }

    /// Mark every unfinished pair Failed and drop queued triggered checks.
    /// Returns the transactions that were outstanding.
    pub fn cancel_outstanding(&mut self) -> Vec<crate::stun::TransactionId> {
        self.triggered.clear();
        let mut cancelled = Vec::new();
        for pair in &mut self.pairs {
            if let Some(id) = pair.transaction.take() {
                cancelled.push(id);
            }
            if !pair.state.is_terminal() {
                pair.state = PairState::Failed;
            }
        }
        cancelled
    }

    /// Fail the pairs using a local candidate that no longer exists.
    /// Returns the transactions that were outstanding.
    pub fn fail_local(&mut self, local: SocketAddr) -> Vec<crate::stun::TransactionId> {
        let mut cancelled = Vec::new();
        let mut removed = Vec::new();
        for pair in self.pairs.iter_mut().filter(|p| p.local.address == local || p.local.base == local) {
            if let Some(id) = pair.transaction.take() {
                cancelled.push(id);
            }
            pair.state = PairState::Failed;
            pair.valid = false;
            removed.push(pair.id);
        }
        self.triggered.retain(|t| !removed.contains(&t.pair));
        cancelled
    }

    /// Forget every pair
    pub fn clear(&mut self) {
        self.pairs.clear();
        self.triggered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, foundation: &str, priority: u32) -> Candidate {
        let mut c = Candidate::host(addr.parse().unwrap(), 1, 65535, foundation.to_string());
        c.priority = priority;
        c
    }

    fn pair(id: u64, local: &Candidate, remote: &Candidate) -> CandidatePair {
        CandidatePair::new(PairId(id), local.clone(), remote.clone(), IceRole::Controlling)
    }

    #[test]
    fn test_pairs_are_sorted_and_deduplicated() {
        let l1 = host("10.0.0.1:5000", "1", 100);
        let l2 = host("10.0.1.1:5000", "2", 200);
        let r1 = host("10.0.0.2:6000", "3", 150);

        let mut list = Checklist::new();
        assert!(list.insert(pair(0, &l1, &r1)));
        assert!(list.insert(pair(1, &l2, &r1)));
        assert!(!list.insert(pair(2, &l1, &r1)));

        let order: Vec<u64> = list.pairs().iter().map(|p| p.id.0).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_next_ordinary_prefers_waiting_then_unblocked_frozen() {
        let l1 = host("10.0.0.1:5000", "1", 300);
        let l2 = host("10.0.1.1:5000", "1", 200);
        let r1 = host("10.0.0.2:6000", "9", 100);

        let mut list = Checklist::new();
        list.insert(pair(0, &l1, &r1));
        list.insert(pair(1, &l2, &r1));

        // Both Frozen, same foundation: the highest priority one goes first
        assert_eq!(list.next_ordinary(), Some(PairId(0)));

        list.get_mut(PairId(0)).unwrap().state = PairState::InProgress;
        // Its group is busy, nothing else is eligible
        assert_eq!(list.next_ordinary(), None);

        list.get_mut(PairId(0)).unwrap().state = PairState::Failed;
        assert_eq!(list.unfreeze_next_in_group("1:9"), Some(PairId(1)));
        assert_eq!(list.next_ordinary(), Some(PairId(1)));
    }

    #[test]
    fn test_unfreeze_foundation() {
        let l1 = host("10.0.0.1:5000", "1", 300);
        let l2 = host("10.0.1.1:5000", "2", 200);
        let r1 = host("10.0.0.2:6000", "9", 100);

        let mut list = Checklist::new();
        list.insert(pair(0, &l1, &r1));
        list.insert(pair(1, &l2, &r1));

        assert_eq!(list.unfreeze_foundation("2:9"), 1);
        assert_eq!(list.get(PairId(1)).unwrap().state, PairState::Waiting);
        assert_eq!(list.get(PairId(0)).unwrap().state, PairState::Frozen);
    }

    #[test]
    fn test_triggered_queue_deduplicates() {
        let mut list = Checklist::new();
        list.push_triggered(TriggeredCheck { pair: PairId(4), nominate: false });
        list.push_triggered(TriggeredCheck { pair: PairId(5), nominate: false });
        list.push_triggered(TriggeredCheck { pair: PairId(4), nominate: true });

        assert_eq!(list.pop_triggered(), Some(TriggeredCheck { pair: PairId(4), nominate: true }));
        assert_eq!(list.pop_triggered(), Some(TriggeredCheck { pair: PairId(5), nominate: false }));
        assert_eq!(list.pop_triggered(), None);
    }

    #[test]
    fn test_outstanding_and_best_valid() {
        let l1 = host("10.0.0.1:5000", "1", 300);
        let l2 = host("10.0.1.1:5000", "2", 200);
        let r1 = host("10.0.0.2:6000", "9", 100);

        let mut list = Checklist::new();
        list.insert(pair(0, &l1, &r1));
        list.insert(pair(1, &l2, &r1));

        let low = list.get_mut(PairId(1)).unwrap();
        low.state = PairState::Succeeded;
        low.valid = true;
        let low_priority = low.priority;

        assert_eq!(list.best_valid().map(|p| p.id), Some(PairId(1)));
        assert!(list.has_outstanding_above(low_priority));
        assert!(!list.all_terminal());

        list.cancel_outstanding();
        assert!(!list.has_outstanding_above(low_priority));
        assert!(list.all_terminal());
    }

    #[test]
    fn test_rebalance_moves_waiting_to_best_pair_of_group() {
        let l1 = host("10.0.0.1:5000", "1", 100);
        let l2 = host("10.0.0.1:5002", "1", 300);
        let r1 = host("10.0.0.2:6000", "9", 100);

        let mut list = Checklist::new();
        let mut first = pair(0, &l1, &r1);
        first.state = PairState::Waiting;
        list.insert(first);
        // A higher-priority pair of the same group arrives later
        list.insert(pair(1, &l2, &r1));
        list.rebalance_waiting("1:9");

        assert_eq!(list.get(PairId(1)).unwrap().state, PairState::Waiting);
        assert_eq!(list.get(PairId(0)).unwrap().state, PairState::Frozen);
        assert_eq!(list.next_ordinary(), Some(PairId(1)));

        // Once the group has started, the Waiting pair stays put
        list.get_mut(PairId(1)).unwrap().state = PairState::InProgress;
        list.get_mut(PairId(0)).unwrap().state = PairState::Waiting;
        list.rebalance_waiting("1:9");
        assert_eq!(list.get(PairId(0)).unwrap().state, PairState::Waiting);
    }

    #[test]
    fn test_update_remote_reprioritises_pairs() {
        let l1 = host("10.0.0.1:5000", "1", 300);
        let l2 = host("10.0.1.1:5000", "2", 200);
        let r1 = host("10.0.0.2:6000", "9", 100);
        let r2 = host("10.0.0.3:6000", "8", 150);

        let mut list = Checklist::new();
        list.insert(pair(0, &l1, &r1));
        list.insert(pair(1, &l2, &r2));
        assert_eq!(list.pairs()[0].id, PairId(1));

        let signalled = host("10.0.0.2:6000", "7", 2_000_000);
        assert_eq!(list.update_remote(&signalled, IceRole::Controlling), 1);

        let updated = list.get(PairId(0)).unwrap();
        assert_eq!(updated.remote.foundation, "7");
        assert_eq!(
            updated.priority,
            CandidatePair::compute_priority(300, 2_000_000, IceRole::Controlling)
        );
        assert_eq!(list.pairs()[0].id, PairId(0));
    }
}
