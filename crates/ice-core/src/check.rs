//! Connectivity checks
//!
//! Pair formation, the pacing of outgoing checks, and the handling of
//! incoming Binding requests and check responses.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateType, MAX_PRIORITY};
use crate::checklist::TriggeredCheck;
use crate::config::{IceRole, NominationMode};
use crate::error::Error;
use crate::event::IceAgentEvent;
use crate::pair::{CandidatePair, PairId, PairState};
use crate::session::{IceSession, TransactionKind};
use crate::stream::{Component, ComponentId, ComponentState, StreamId};
use crate::stun::{
    verify_fingerprint, verify_integrity, PendingTransaction, StunAttribute, StunAttributeType,
    StunClass, StunMessage, StunMessageType, TransactionId,
};

/// Error code for a role conflict (RFC 8445 section 7.3.1.1)
const ROLE_CONFLICT: u16 = 487;

impl IceSession {
    /// Pair every local host and relayed candidate of a component with every
    /// remote candidate of the same address family. Existing pairs are kept.
    pub(crate) fn form_pairs(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId) {
        if self.config.lite {
            return;
        }
        let role = self.role;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let first_component = stream.components.first().map(|c| c.id) == Some(component_id);
        let succeeded: HashSet<String> = stream
            .components
            .iter()
            .filter(|c| c.id != component_id)
            .flat_map(|c| c.checklist.pairs().iter())
            .filter(|p| p.state == PairState::Succeeded)
            .map(|p| p.foundation())
            .collect();

        let Some(component) = stream.component_mut(component_id) else {
            return;
        };
        if matches!(component.state, ComponentState::Completed | ComponentState::Failed) {
            return;
        }

        let locals: Vec<Candidate> = component
            .local_candidates
            .iter()
            .filter(|c| matches!(c.candidate_type, CandidateType::Host | CandidateType::Relayed))
            .cloned()
            .collect();
        let remotes = component.remote_candidates.clone();

        let mut added = 0;
        for local in &locals {
            for remote in remotes.iter().filter(|r| r.address.is_ipv4() == local.address.is_ipv4()) {
                if component.checklist.find(local.address, remote.address).is_some() {
                    continue;
                }
                let id = PairId(self.next_pair_id);
                self.next_pair_id += 1;
                let mut pair = CandidatePair::new(id, local.clone(), remote.clone(), role);
                let foundation = pair.foundation();
                pair.state = if first_component {
                    if component.checklist.pairs().iter().any(|p| p.foundation() == foundation) {
                        PairState::Frozen
                    } else {
                        PairState::Waiting
                    }
                } else if succeeded.contains(&foundation) {
                    PairState::Waiting
                } else {
                    PairState::Frozen
                };
                trace!("New pair {} {} -> {} ({:?})", id, local.address, remote.address, pair.state);
                component.checklist.insert(pair);
                if first_component {
                    component.checklist.rebalance_waiting(&foundation);
                }
                added += 1;
            }
        }

        if added == 0 {
            // Remote candidates that pair with nothing local still start the
            // checks, so the component can fail once gathering is done
            if !component.gathering.started
                || !component.checklist.is_empty()
                || component.remote_candidates.is_empty()
            {
                return;
            }
            debug!(
                "Stream {} component {}: none of {} remote candidate(s) can be paired",
                stream_id,
                component_id,
                component.remote_candidates.len()
            );
            self.set_component_state(stream_id, component_id, ComponentState::Checking);
            self.update_component_state(stream_id, component_id);
            return;
        }
        debug!(
            "Stream {} component {}: {} new pair(s), {} total",
            stream_id,
            component_id,
            added,
            component.checklist.len()
        );
        self.set_component_state(stream_id, component_id, ComponentState::Checking);
        self.arm_pacer(now);
    }

    /// One pacing tick: send at most one check, triggered checks first
    pub(crate) fn on_pacer_tick(&mut self, now: Instant) {
        self.pacer.next_tick = None;
        if self.config.lite || self.remote_credentials.is_none() {
            return;
        }

        let active: Vec<(StreamId, ComponentId)> = self
            .streams
            .values()
            .flat_map(|s| {
                s.components
                    .iter()
                    .filter(|c| matches!(c.state, ComponentState::Checking | ComponentState::Connected))
                    .map(move |c| (s.id, c.id))
            })
            .collect();
        if active.is_empty() {
            return;
        }

        let aggressive =
            self.role == IceRole::Controlling && self.config.nomination == NominationMode::Aggressive;
        let count = active.len();
        let start = self.pacer.cursor % count;
        let mut next: Option<(usize, PairId, bool)> = None;

        'triggered: for offset in 0..count {
            let (stream_id, component_id) = active[(start + offset) % count];
            let Some(component) = self.component_mut(stream_id, component_id) else {
                continue;
            };
            while let Some(check) = component.checklist.pop_triggered() {
                let runnable = component.checklist.get(check.pair).is_some_and(|p| {
                    p.state != PairState::InProgress && (p.state != PairState::Succeeded || check.nominate)
                });
                if runnable {
                    next = Some((offset, check.pair, check.nominate));
                    break 'triggered;
                }
            }
        }

        if next.is_none() {
            for offset in 0..count {
                let (stream_id, component_id) = active[(start + offset) % count];
                let ordinary = self
                    .component_mut(stream_id, component_id)
                    .and_then(|c| c.checklist.next_ordinary());
                if let Some(pair) = ordinary {
                    next = Some((offset, pair, aggressive));
                    break;
                }
            }
        }

        if let Some((offset, pair, nominate)) = next {
            let (stream_id, component_id) = active[(start + offset) % count];
            self.pacer.cursor = (start + offset + 1) % count;
            self.start_check(now, stream_id, component_id, pair, nominate);
            self.pacer.last_sent = Some(now);
            self.pacer.next_tick = Some(now + self.config.check_interval());
        }
    }

    pub(crate) fn component_mut(&mut self, stream_id: StreamId, component_id: ComponentId) -> Option<&mut Component> {
        self.streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
    }

    /// Send a Binding request on a pair
    fn start_check(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId, pair_id: PairId, nominate: bool) {
        let Some(remote_credentials) = self.remote_credentials.clone() else {
            return;
        };
        let role = self.role;
        let tiebreaker = self.tiebreaker;
        let aggressive = self.config.nomination == NominationMode::Aggressive;
        let local_ufrag = self.local_credentials.ufrag.clone();

        let Some(pair) = self
            .component_mut(stream_id, component_id)
            .and_then(|c| c.checklist.get(pair_id))
        else {
            return;
        };
        let (local, remote) = (pair.local.clone(), pair.remote.address);
        let use_candidate = role == IceRole::Controlling && (nominate || aggressive);

        let id = self.transactions.allocate_id(&mut self.rng);
        let mut msg = StunMessage::with_transaction_id(StunMessageType::BINDING_REQUEST, id);
        msg.add_attribute(StunAttribute::username(&format!(
            "{}:{}",
            remote_credentials.ufrag, local_ufrag
        )));
        msg.add_attribute(StunAttribute::priority(local.prflx_priority()));
        msg.add_attribute(match role {
            IceRole::Controlling => StunAttribute::ice_controlling(tiebreaker),
            IceRole::Controlled => StunAttribute::ice_controlled(tiebreaker),
        });
        if use_candidate {
            msg.add_attribute(StunAttribute::use_candidate());
        }
        self.add_software(&mut msg);
        let data = msg.encode_with_integrity(remote_credentials.pwd.as_bytes());

        let Some(transmit) = self.route(now, local.base, remote, &data) else {
            return;
        };
        let kind = TransactionKind::Check {
            stream: stream_id,
            component: component_id,
            pair: pair_id,
            use_candidate,
            role,
        };
        let key = remote_credentials.pwd.into_bytes();
        let transmit = self
            .transactions
            .start(now, id, kind, transmit, local.base, remote, Some(key));
        self.transmits.push_back(transmit);

        let Some(component) = self.component_mut(stream_id, component_id) else {
            return;
        };
        let previous = component.checklist.get_mut(pair_id).and_then(|pair| {
            if pair.state != PairState::Succeeded {
                pair.state = PairState::InProgress;
            }
            pair.transaction.replace(id)
        });
        if use_candidate && !aggressive {
            component.nominating = Some(pair_id);
        }
        if let Some(previous) = previous {
            self.transactions.take(&previous);
        }
        debug!(
            "Check {} on {} {} -> {}{}",
            id,
            pair_id,
            local.base,
            remote,
            if use_candidate { " (USE-CANDIDATE)" } else { "" }
        );
    }

    pub(crate) fn on_check_response(
        &mut self,
        now: Instant,
        id: TransactionId,
        pending: PendingTransaction<TransactionKind>,
        local: SocketAddr,
        from: SocketAddr,
        msg: &StunMessage,
    ) {
        let TransactionKind::Check {
            stream,
            component,
            pair,
            use_candidate,
            role,
        } = pending.kind
        else {
            return;
        };
        if let Some(p) = self
            .component_mut(stream, component)
            .and_then(|c| c.checklist.get_mut(pair))
        {
            if p.transaction == Some(id) {
                p.transaction = None;
            }
        }

        if from != pending.peer || local != pending.local {
            debug!(
                "Non-symmetric response on {}: sent {} -> {}, got {} -> {}",
                pair, pending.local, pending.peer, from, local
            );
            self.on_check_failed(now, stream, component, pair);
            return;
        }

        match msg.msg_type.class {
            StunClass::SuccessResponse => self.on_check_success(now, stream, component, pair, use_candidate, msg),
            StunClass::ErrorResponse if msg.error_code() == Some(ROLE_CONFLICT) => {
                self.on_role_conflict_response(now, stream, component, pair, role)
            }
            _ => {
                debug!("Check on {} rejected with {:?}", pair, msg.error_code());
                self.on_check_failed(now, stream, component, pair);
            }
        }
    }

    pub(crate) fn on_check_failed(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId, pair_id: PairId) {
        let Some(component) = self.component_mut(stream_id, component_id) else {
            return;
        };
        let was_nominating = component.nominating == Some(pair_id);
        let Some(pair) = component.checklist.get_mut(pair_id) else {
            return;
        };
        pair.transaction = None;
        if was_nominating {
            // A failed nomination check removes the pair from the valid list
            warn!("Nomination check on {} failed", pair_id);
            pair.valid = false;
            component.nominating = None;
        }
        let Some(pair) = component.checklist.get_mut(pair_id) else {
            return;
        };
        if !was_nominating && pair.state == PairState::Succeeded {
            return;
        }
        pair.state = PairState::Failed;
        let foundation = pair.foundation();
        component.checklist.unfreeze_next_in_group(&foundation);

        self.evaluate_nomination(now, stream_id, component_id);
        self.update_component_state(stream_id, component_id);
        self.arm_pacer(now);
    }

    fn on_role_conflict_response(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component_id: ComponentId,
        pair_id: PairId,
        sent_role: IceRole,
    ) {
        let retried = self
            .component_mut(stream_id, component_id)
            .and_then(|c| c.checklist.get(pair_id))
            .map(|p| p.role_conflict_retried);
        match retried {
            None => return,
            Some(true) => {
                warn!("{} persists on {}", Error::RoleConflict, pair_id);
                self.on_check_failed(now, stream_id, component_id, pair_id);
                return;
            }
            Some(false) => {}
        }

        if self.role == sent_role {
            info!("{} reported by peer on {}", Error::RoleConflict, pair_id);
            self.switch_role(sent_role.opposite());
        }

        let Some(component) = self.component_mut(stream_id, component_id) else {
            return;
        };
        if component.nominating == Some(pair_id) {
            component.nominating = None;
        }
        if let Some(pair) = component.checklist.get_mut(pair_id) {
            pair.role_conflict_retried = true;
            if pair.state != PairState::Succeeded {
                pair.state = PairState::Waiting;
            }
        }
        component.checklist.push_triggered(TriggeredCheck {
            pair: pair_id,
            nominate: false,
        });
        self.arm_pacer(now);
    }

    fn on_check_success(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component_id: ComponentId,
        pair_id: PairId,
        use_candidate: bool,
        msg: &StunMessage,
    ) {
        let Some(mapped) = msg.mapped_address() else {
            debug!("Check response on {} without XOR-MAPPED-ADDRESS", pair_id);
            self.on_check_failed(now, stream_id, component_id, pair_id);
            return;
        };
        let role = self.role;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let Some(component) = stream.component_mut(component_id) else {
            return;
        };
        let Some(pair) = component.checklist.get_mut(pair_id) else {
            return;
        };
        pair.state = PairState::Succeeded;
        let (pair_local, pair_remote) = (pair.local.clone(), pair.remote.clone());
        let nominate_on_success = std::mem::take(&mut pair.nominate_on_success);
        let foundation = pair.foundation();
        if component.nominating == Some(pair_id) {
            component.nominating = None;
        }

        // The mapped address may reveal a local peer reflexive candidate
        let valid_local = match component.local_candidate(mapped) {
            Some(candidate) => candidate.clone(),
            None => {
                let foundation =
                    self.foundations
                        .foundation(CandidateType::PeerReflexive, pair_local.base.ip(), None);
                let candidate = Candidate::peer_reflexive(
                    mapped,
                    pair_local.base,
                    component_id,
                    pair_local.prflx_priority(),
                    foundation,
                );
                debug!("Discovered local peer reflexive candidate {}", mapped);
                component.local_candidates.push(candidate.clone());
                candidate
            }
        };

        let valid_id = if valid_local.address == pair_local.address {
            pair_id
        } else if let Some(existing) = component.checklist.find(valid_local.address, pair_remote.address) {
            existing.id
        } else {
            let id = PairId(self.next_pair_id);
            self.next_pair_id += 1;
            let mut discovered = CandidatePair::new(id, valid_local, pair_remote, role);
            discovered.state = PairState::Succeeded;
            component.checklist.insert(discovered);
            id
        };
        if let Some(valid) = component.checklist.get_mut(valid_id) {
            valid.valid = true;
            valid.state = PairState::Succeeded;
        }
        component.first_valid_at.get_or_insert(now);
        component.checklist.unfreeze_next_in_group(&foundation);
        trace!("{} succeeded, valid pair {}", pair_id, valid_id);

        for other in stream.components.iter_mut().filter(|c| c.id != component_id) {
            other.checklist.unfreeze_foundation(&foundation);
        }

        let nominate = (use_candidate && role == IceRole::Controlling)
            || (role == IceRole::Controlled && nominate_on_success);
        if nominate {
            self.nominate(now, stream_id, component_id, valid_id);
        }
        self.evaluate_nomination(now, stream_id, component_id);
        self.update_component_state(stream_id, component_id);
        self.arm_pacer(now);
    }

    /// Answer a Binding request from the peer
    pub(crate) fn handle_binding_request(
        &mut self,
        now: Instant,
        local: SocketAddr,
        from: SocketAddr,
        msg: &StunMessage,
        raw: &[u8],
    ) {
        let Some(&(stream_id, component_id)) = self.bases.get(&local) else {
            trace!("Binding request on unknown local address {}", local);
            return;
        };

        let username = msg
            .get_attribute(StunAttributeType::Username)
            .and_then(|attr| attr.as_string().ok());
        let expected = format!("{}:", self.local_credentials.ufrag);
        if !username.as_deref().is_some_and(|u| u.starts_with(&expected)) {
            debug!("Dropping Binding request from {}: USERNAME mismatch", from);
            return;
        }
        if let Err(e) = verify_integrity(raw, self.local_credentials.pwd.as_bytes()) {
            debug!("Dropping Binding request from {}: {}", from, e);
            return;
        }
        if let Err(e) = verify_fingerprint(raw) {
            debug!("Dropping Binding request from {}: {}", from, e);
            return;
        }

        if !self.resolve_role_conflict(now, local, from, msg) {
            return;
        }

        let mut response = StunMessage::success_response(msg);
        response.add_attribute(StunAttribute::xor_mapped_address(from, &msg.transaction_id));
        self.add_software(&mut response);
        let data = response.encode_with_integrity(self.local_credentials.pwd.as_bytes());
        if let Some(transmit) = self.route(now, local, from, &data) {
            self.transmits.push_back(transmit);
        }

        let priority = msg
            .get_attribute(StunAttributeType::Priority)
            .and_then(|attr| attr.as_u32().ok())
            .filter(|p| (1..=MAX_PRIORITY).contains(p));
        let use_candidate = msg.has_attribute(StunAttributeType::UseCandidate);
        self.learn_from_request(now, stream_id, component_id, local, from, priority, use_candidate);
    }

    /// Apply the role conflict rules to an incoming request. Returns false
    /// when the request was answered with 487 and must not be processed.
    fn resolve_role_conflict(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, msg: &StunMessage) -> bool {
        let theirs = |attr| msg.get_attribute(attr).and_then(|a| a.as_u64().ok());
        match self.role {
            IceRole::Controlling => {
                let Some(their_tiebreaker) = theirs(StunAttributeType::IceControlling) else {
                    return true;
                };
                if self.tiebreaker >= their_tiebreaker {
                    self.send_role_conflict(now, local, from, msg);
                    return false;
                }
                self.switch_role(IceRole::Controlled);
            }
            IceRole::Controlled => {
                let Some(their_tiebreaker) = theirs(StunAttributeType::IceControlled) else {
                    return true;
                };
                if !self.config.lite && self.tiebreaker >= their_tiebreaker {
                    self.switch_role(IceRole::Controlling);
                } else {
                    self.send_role_conflict(now, local, from, msg);
                    return false;
                }
            }
        }
        true
    }

    fn send_role_conflict(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, request: &StunMessage) {
        debug!("Answering {} with 487 Role Conflict", from);
        let mut response = StunMessage::error_response(request, ROLE_CONFLICT, "Role Conflict");
        self.add_software(&mut response);
        let data = response.encode_with_integrity(self.local_credentials.pwd.as_bytes());
        if let Some(transmit) = self.route(now, local, from, &data) {
            self.transmits.push_back(transmit);
        }
    }

    /// Learn from an authenticated request: the source may be a new peer
    /// reflexive candidate, and the pair it arrived on gets a triggered check
    #[allow(clippy::too_many_arguments)]
    fn learn_from_request(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component_id: ComponentId,
        local: SocketAddr,
        from: SocketAddr,
        priority: Option<u32>,
        use_candidate: bool,
    ) {
        let role = self.role;
        let lite = self.config.lite;
        let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        else {
            return;
        };
        if matches!(component.state, ComponentState::Failed) {
            return;
        }

        let remote = match component.remote_candidate(from) {
            Some(candidate) => candidate.clone(),
            None => {
                self.prflx_count += 1;
                let priority = priority.unwrap_or_else(|| {
                    Candidate::compute_priority(CandidateType::PeerReflexive, u16::MAX, component_id)
                });
                let mut candidate = Candidate::peer_reflexive(
                    from,
                    from,
                    component_id,
                    priority,
                    format!("prflx{}", self.prflx_count),
                );
                candidate.related_address = None;
                debug!("Learned remote peer reflexive candidate {}", from);
                component.remote_candidates.push(candidate.clone());
                self.events.push_back(IceAgentEvent::NewRemoteCandidate {
                    stream_id,
                    candidate: candidate.clone(),
                });
                candidate
            }
        };
        let Some(local_candidate) = component.local_candidate(local).cloned() else {
            return;
        };

        let mut nominate = None;
        let pair_id = match component.checklist.find(local, from).map(|p| p.id) {
            Some(id) => id,
            None => {
                let id = PairId(self.next_pair_id);
                self.next_pair_id += 1;
                component
                    .checklist
                    .insert(CandidatePair::new(id, local_candidate, remote, role));
                id
            }
        };

        if lite {
            if let Some(pair) = component.checklist.get_mut(pair_id) {
                pair.state = PairState::Succeeded;
                pair.valid = true;
            }
            component.first_valid_at.get_or_insert(now);
            if use_candidate {
                nominate = Some(pair_id);
            }
        } else {
            let controlled_nomination = use_candidate && role == IceRole::Controlled;
            let state = component.checklist.get(pair_id).map(|p| p.state);
            match state {
                Some(PairState::Succeeded) => {
                    if controlled_nomination {
                        nominate = valid_pair_for(component, pair_id);
                    }
                }
                Some(PairState::InProgress) => {
                    if let Some(pair) = component.checklist.get_mut(pair_id) {
                        pair.nominate_on_success |= controlled_nomination;
                    }
                }
                Some(_) => {
                    if let Some(pair) = component.checklist.get_mut(pair_id) {
                        pair.state = PairState::Waiting;
                        pair.nominate_on_success |= controlled_nomination;
                    }
                    component.checklist.push_triggered(TriggeredCheck {
                        pair: pair_id,
                        nominate: false,
                    });
                }
                None => {}
            }
        }

        self.set_component_state(stream_id, component_id, ComponentState::Checking);
        if let Some(pair_id) = nominate {
            self.nominate(now, stream_id, component_id, pair_id);
        }
        self.update_component_state(stream_id, component_id);
        self.arm_pacer(now);
    }
}

/// The valid pair produced by checks on `pair_id`: the pair itself, or the
/// valid pair sharing its remote candidate and local base
fn valid_pair_for(component: &Component, pair_id: PairId) -> Option<PairId> {
    let pair = component.checklist.get(pair_id)?;
    if pair.valid {
        return Some(pair.id);
    }
    component
        .checklist
        .pairs()
        .iter()
        .find(|p| p.valid && p.remote.address == pair.remote.address && p.local.base == pair.local.base)
        .map(|p| p.id)
}
