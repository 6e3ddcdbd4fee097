//! STUN client transactions
//!
//! Every outstanding request lives in a [`TransactionTable`] keyed by its
//! transaction id. The table owns the retransmission schedule: the first
//! retransmission fires after the initial RTO, each following interval doubles
//! up to the maximum RTO, and after the configured number of retransmissions
//! the transaction expires. Ids are unique within one table at any instant.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::trace;

use super::message::TransactionId;
use crate::config::IceConfig;
use crate::transport::Transmit;

/// Retransmission schedule for STUN requests over UDP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Interval before the first retransmission
    pub initial_rto: Duration,
    /// Upper bound for the doubling interval
    pub max_rto: Duration,
    /// Retransmissions before the transaction times out
    pub max_retransmits: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(250),
            max_rto: Duration::from_secs(3),
            max_retransmits: 6,
        }
    }
}

impl From<&IceConfig> for RetransmitPolicy {
    fn from(config: &IceConfig) -> Self {
        Self {
            initial_rto: config.initial_rto(),
            max_rto: config.max_rto(),
            max_retransmits: config.max_retransmits,
        }
    }
}

/// An outstanding request
#[derive(Debug, Clone)]
pub struct PendingTransaction<K> {
    /// What the request was for
    pub kind: K,
    /// Datagram resent on every retransmission
    pub transmit: Transmit,
    /// Local address the response must arrive on
    pub local: SocketAddr,
    /// Address the response must come from
    pub peer: SocketAddr,
    /// Key that must authenticate the response, if any
    pub integrity_key: Option<Vec<u8>>,
    /// When the first attempt was sent
    pub started_at: Instant,
    /// Retransmissions sent so far
    pub retransmits: u32,
    rto: Duration,
    deadline: Instant,
    seq: u64,
}

/// Timer outcome for a transaction
#[derive(Debug)]
pub enum TransactionTimer<K> {
    /// Resend this datagram
    Retransmit(Transmit),
    /// Retransmissions are exhausted
    Expired(TransactionId, PendingTransaction<K>),
}

/// Agent-scoped map of outstanding requests
#[derive(Debug)]
pub struct TransactionTable<K> {
    policy: RetransmitPolicy,
    pending: HashMap<TransactionId, PendingTransaction<K>>,
    next_seq: u64,
}

impl<K> TransactionTable<K> {
    pub fn new(policy: RetransmitPolicy) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Draw a transaction id that is not currently in use
    pub fn allocate_id<R: Rng + ?Sized>(&self, rng: &mut R) -> TransactionId {
        loop {
            let id = TransactionId::random(rng);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a request whose first attempt is being sent now.
    /// Returns the datagram to send.
    pub fn start(
        &mut self,
        now: Instant,
        id: TransactionId,
        kind: K,
        transmit: Transmit,
        local: SocketAddr,
        peer: SocketAddr,
        integrity_key: Option<Vec<u8>>,
    ) -> Transmit {
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!("Starting transaction {} to {}", id, transmit.destination);
        self.pending.insert(
            id,
            PendingTransaction {
                kind,
                transmit: transmit.clone(),
                local,
                peer,
                integrity_key,
                started_at: now,
                retransmits: 0,
                rto: self.policy.initial_rto,
                deadline: now + self.policy.initial_rto,
                seq,
            },
        );
        transmit
    }

    pub fn get(&self, id: &TransactionId) -> Option<&PendingTransaction<K>> {
        self.pending.get(id)
    }

    /// Remove a transaction, typically because its response arrived
    pub fn take(&mut self, id: &TransactionId) -> Option<PendingTransaction<K>> {
        self.pending.remove(id)
    }

    /// Earliest retransmission or expiry deadline
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Process every deadline at or before `now`, in the order the
    /// transactions were started
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<TransactionTimer<K>> {
        let mut due: Vec<(u64, TransactionId)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (p.seq, *id))
            .collect();
        due.sort();

        let mut timers = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(pending) = self.pending.get_mut(&id) else {
                continue;
            };
            if pending.retransmits < self.policy.max_retransmits {
                pending.retransmits += 1;
                pending.rto = (pending.rto * 2).min(self.policy.max_rto);
                pending.deadline = now + pending.rto;
                trace!("Retransmitting {} (attempt {})", id, pending.retransmits + 1);
                timers.push(TransactionTimer::Retransmit(pending.transmit.clone()));
            } else if let Some(pending) = self.pending.remove(&id) {
                timers.push(TransactionTimer::Expired(id, pending));
            }
        }
        timers
    }

    /// Cancel every transaction whose kind matches `predicate`
    pub fn cancel_where<F>(&mut self, mut predicate: F) -> Vec<(TransactionId, K)>
    where
        F: FnMut(&K) -> bool,
    {
        let ids: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, p)| predicate(&p.kind))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p.kind)))
            .collect()
    }

    /// Drop every outstanding transaction
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
