//! Candidate gathering: host, server reflexive and relayed candidates

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::candidate::{Candidate, CandidateType};
use crate::config::TurnServerConfig;
use crate::error::{Error, Result};
use crate::event::IceAgentEvent;
use crate::session::{IceSession, TransactionKind};
use crate::stream::{ComponentId, ComponentState, StreamId};
use crate::stun::{StunAttribute, StunClass, StunMessage, StunMessageType};
use crate::transport::Transmit;
use crate::turn::{AllocationState, TurnAllocation, TurnOp, TurnOutcome};

fn same_family(a: SocketAddr, b: SocketAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

impl IceSession {
    /// Start gathering for a stream on the given local bases.
    ///
    /// Host candidates are reported immediately. Server reflexive and relayed
    /// candidates follow as STUN and TURN servers answer. Each component
    /// reports `GatheringComplete` once every server answered or timed out, or
    /// when the gathering deadline passes.
    pub fn gather_candidates(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        bases: &[(ComponentId, SocketAddr)],
    ) -> Result<()> {
        if bases.is_empty() {
            return Err(Error::GatheringError("no local addresses to gather on".to_string()));
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        for (component_id, _) in bases {
            if stream.component(*component_id).is_none() {
                return Err(Error::UnknownComponent {
                    stream: stream_id,
                    component: *component_id,
                });
            }
        }
        if stream.components.iter().any(|c| c.gathering.started) {
            return Err(Error::InvalidState(format!(
                "gathering already started for stream {}",
                stream_id
            )));
        }

        let deadline = now + self.config.gathering_timeout();
        let component_ids: Vec<ComponentId> = stream.components.iter().map(|c| c.id).collect();
        for component in &mut stream.components {
            component.gathering.started = true;
            component.gathering.deadline = Some(deadline);
        }
        for component_id in &component_ids {
            self.set_component_state(stream_id, *component_id, ComponentState::Gathering);
        }

        let stun_servers = self.config.stun_servers.clone();
        let turn_servers = self.config.turn_servers.clone();
        let mut host_count: Vec<(ComponentId, u16)> = Vec::new();

        for &(component_id, base) in bases {
            let index = match host_count.iter_mut().find(|(c, _)| *c == component_id) {
                Some((_, count)) => {
                    *count += 1;
                    *count - 1
                }
                None => {
                    host_count.push((component_id, 1));
                    0
                }
            };
            self.add_host_candidate(stream_id, component_id, base, u16::MAX.saturating_sub(index));

            if self.config.lite {
                continue;
            }
            for server in stun_servers.iter().filter(|s| same_family(**s, base)) {
                self.start_server_reflexive(now, stream_id, component_id, base, *server);
            }
            for server in turn_servers.iter().filter(|s| same_family(s.address, base)) {
                self.start_allocation(now, stream_id, component_id, base, server);
            }
        }

        info!(
            "Gathering started for stream {} on {} local address(es)",
            stream_id,
            bases.len()
        );

        for component_id in component_ids {
            self.form_pairs(now, stream_id, component_id);
            self.maybe_finish_gathering(stream_id, component_id);
        }
        Ok(())
    }

    fn add_host_candidate(&mut self, stream_id: StreamId, component_id: ComponentId, base: SocketAddr, local_preference: u16) {
        let foundation = self.foundations.foundation(CandidateType::Host, base.ip(), None);
        let candidate = Candidate::host(base, component_id, local_preference, foundation);
        self.add_local_candidate(stream_id, candidate);
        self.bases.insert(base, (stream_id, component_id));
    }

    /// Record a gathered candidate and report it. Duplicates by address are dropped.
    fn add_local_candidate(&mut self, stream_id: StreamId, candidate: Candidate) -> bool {
        let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(candidate.component))
        else {
            return false;
        };
        if component.local_candidate(candidate.address).is_some() {
            return false;
        }
        debug!("Gathered local candidate {}", candidate);
        component.local_candidates.push(candidate.clone());
        self.events
            .push_back(IceAgentEvent::LocalCandidateGathered { stream_id, candidate });
        true
    }

    /// Add the configured SOFTWARE attribute
    pub(crate) fn add_software(&self, msg: &mut StunMessage) {
        if let Some(software) = &self.config.software {
            msg.add_attribute(StunAttribute::software(software));
        }
    }

    fn start_server_reflexive(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component_id: ComponentId,
        base: SocketAddr,
        server: SocketAddr,
    ) {
        let id = self.transactions.allocate_id(&mut self.rng);
        let mut msg = StunMessage::with_transaction_id(StunMessageType::BINDING_REQUEST, id);
        self.add_software(&mut msg);

        let kind = TransactionKind::ServerReflexive {
            stream: stream_id,
            component: component_id,
            base,
            server,
        };
        let transmit = Transmit {
            source: base,
            destination: server,
            data: msg.encode_with_fingerprint(),
        };
        let transmit = self.transactions.start(now, id, kind, transmit, base, server, None);
        self.transmits.push_back(transmit);

        if let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        {
            component.gathering.pending += 1;
        }
        debug!("Binding request {} to STUN server {} from {}", id, server, base);
    }

    pub(crate) fn on_server_reflexive_response(
        &mut self,
        stream_id: StreamId,
        component_id: ComponentId,
        base: SocketAddr,
        server: SocketAddr,
        msg: &StunMessage,
    ) {
        let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        else {
            return;
        };
        component.gathering.pending = component.gathering.pending.saturating_sub(1);
        if component.gathering.done {
            return;
        }
        let local_preference = component
            .local_candidate(base)
            .map(|c| c.local_preference())
            .unwrap_or(u16::MAX);

        match msg.msg_type.class {
            StunClass::SuccessResponse => match msg.mapped_address() {
                Some(mapped) if mapped != base => {
                    let foundation =
                        self.foundations
                            .foundation(CandidateType::ServerReflexive, base.ip(), Some(server));
                    let candidate =
                        Candidate::server_reflexive(mapped, base, component_id, local_preference, foundation);
                    self.add_local_candidate(stream_id, candidate);
                }
                Some(_) => debug!("STUN server {} reports no NAT for {}", server, base),
                None => warn!(
                    "{}",
                    Error::GatheringError(format!("response from {} carries no mapped address", server))
                ),
            },
            _ => {
                let (code, reason) = msg
                    .get_attribute(crate::stun::StunAttributeType::ErrorCode)
                    .and_then(|attr| attr.as_error_code().ok())
                    .unwrap_or((0, String::new()));
                warn!(
                    "{}",
                    Error::GatheringError(format!("STUN server {} answered {} {}", server, code, reason))
                );
            }
        }
        self.maybe_finish_gathering(stream_id, component_id);
    }

    fn start_allocation(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component_id: ComponentId,
        base: SocketAddr,
        server: &TurnServerConfig,
    ) {
        let allocation_id = self.next_allocation;
        self.next_allocation += 1;
        self.allocations
            .insert(allocation_id, TurnAllocation::new(stream_id, component_id, base, server));
        if let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        {
            component.gathering.pending += 1;
        }
        debug!("Allocating on TURN server {} from {}", server.address, base);
        self.send_turn_request(now, allocation_id, TurnOp::Allocate);
    }

    /// Send a TURN request as a new transaction
    pub(crate) fn send_turn_request(&mut self, now: Instant, allocation_id: usize, op: TurnOp) {
        let id = self.transactions.allocate_id(&mut self.rng);
        let Some(allocation) = self.allocations.get(&allocation_id) else {
            return;
        };
        let mut msg = allocation.build_request(op, id);
        if let Some(software) = &self.config.software {
            msg.add_attribute(StunAttribute::software(software));
        }
        let transmit = Transmit {
            source: allocation.base,
            destination: allocation.server,
            data: allocation.encode_request(&msg),
        };
        let (base, server, key) = (allocation.base, allocation.server, allocation.integrity_key());
        let kind = TransactionKind::Turn {
            allocation: allocation_id,
            op,
        };
        let transmit = self.transactions.start(now, id, kind, transmit, base, server, key);
        self.transmits.push_back(transmit);
    }

    pub(crate) fn on_turn_response(&mut self, now: Instant, allocation_id: usize, op: TurnOp, msg: &StunMessage) {
        let Some(allocation) = self.allocations.get_mut(&allocation_id) else {
            return;
        };
        match allocation.handle_response(now, op, msg) {
            TurnOutcome::Done => {}
            TurnOutcome::Retry => self.send_turn_request(now, allocation_id, op),
            TurnOutcome::Allocated { relayed, mapped } => {
                self.on_relay_allocated(now, allocation_id, relayed, mapped)
            }
            TurnOutcome::Failed(reason) => match op {
                TurnOp::Allocate => {
                    warn!("{}", Error::GatheringError(reason));
                    self.finish_allocation_gathering(allocation_id);
                }
                TurnOp::Refresh { lifetime } if lifetime > 0 => {
                    warn!("{}", Error::TurnError(reason));
                    self.on_allocation_lost(now, allocation_id);
                }
                _ => {}
            },
        }
    }

    pub(crate) fn on_turn_timeout(&mut self, now: Instant, allocation_id: usize, op: TurnOp) {
        let Some(allocation) = self.allocations.get_mut(&allocation_id) else {
            return;
        };
        let server = allocation.server;
        match op {
            TurnOp::Allocate => {
                allocation.fail();
                warn!(
                    "{}",
                    Error::GatheringError(format!("TURN server {} did not answer", server))
                );
                self.finish_allocation_gathering(allocation_id);
            }
            TurnOp::Refresh { lifetime } if lifetime > 0 => {
                warn!("{}", Error::TurnError(format!("refresh to {} timed out", server)));
                self.on_allocation_lost(now, allocation_id);
            }
            TurnOp::Refresh { .. } => {}
            TurnOp::ChannelBind { peer, .. } => {
                debug!("ChannelBind for {} on {} timed out", peer, server);
                allocation.forget_channel(peer);
            }
        }
    }

    fn on_relay_allocated(
        &mut self,
        now: Instant,
        allocation_id: usize,
        relayed: SocketAddr,
        mapped: Option<SocketAddr>,
    ) {
        let Some(allocation) = self.allocations.get_mut(&allocation_id) else {
            return;
        };
        let (stream_id, component_id, base, server) =
            (allocation.stream, allocation.component, allocation.base, allocation.server);
        let was_gathering = std::mem::replace(&mut allocation.gathering_pending, false);

        let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        else {
            return;
        };
        if was_gathering {
            component.gathering.pending = component.gathering.pending.saturating_sub(1);
        }
        if component.gathering.done {
            debug!("Late TURN allocation {} released", relayed);
            self.release_allocation(allocation_id);
            return;
        }
        let local_preference = component
            .local_candidate(base)
            .map(|c| c.local_preference())
            .unwrap_or(u16::MAX);

        let foundation = self
            .foundations
            .foundation(CandidateType::Relayed, base.ip(), Some(server));
        let relay = Candidate::relayed(relayed, mapped, component_id, local_preference, foundation);
        if self.add_local_candidate(stream_id, relay) {
            self.bases.insert(relayed, (stream_id, component_id));
            if let Some(allocation) = self.allocations.get_mut(&allocation_id) {
                allocation.relay_candidate = Some(relayed);
            }
            info!("Relayed candidate {} via TURN server {}", relayed, server);
        }

        if let Some(mapped) = mapped.filter(|m| *m != base) {
            let foundation = self
                .foundations
                .foundation(CandidateType::ServerReflexive, base.ip(), Some(server));
            let srflx = Candidate::server_reflexive(mapped, base, component_id, local_preference, foundation);
            self.add_local_candidate(stream_id, srflx);
        }

        self.form_pairs(now, stream_id, component_id);
        self.maybe_finish_gathering(stream_id, component_id);
    }

    /// The Allocate of a gathering allocation failed or timed out
    fn finish_allocation_gathering(&mut self, allocation_id: usize) {
        let Some(allocation) = self.allocations.get_mut(&allocation_id) else {
            return;
        };
        if !std::mem::replace(&mut allocation.gathering_pending, false) {
            return;
        }
        let (stream_id, component_id) = (allocation.stream, allocation.component);
        self.on_gathering_op_done(stream_id, component_id);
    }

    /// A refresh failed: the relay candidate and every pair using it are gone
    fn on_allocation_lost(&mut self, now: Instant, allocation_id: usize) {
        let Some(allocation) = self.allocations.get_mut(&allocation_id) else {
            return;
        };
        allocation.fail();
        let (stream_id, component_id) = (allocation.stream, allocation.component);
        let Some(relayed) = allocation.relay_candidate.take() else {
            return;
        };
        warn!("TURN allocation {} lost, removing relayed candidate", relayed);
        self.remove_local_candidate(now, stream_id, component_id, relayed);
    }

    fn remove_local_candidate(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId, address: SocketAddr) {
        self.bases.remove(&address);
        let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        else {
            return;
        };
        component
            .local_candidates
            .retain(|c| c.address != address && c.base != address);
        let cancelled = component.checklist.fail_local(address);
        if let Some(nominating) = component.nominating {
            if component.checklist.get(nominating).is_some_and(|p| !p.valid) {
                component.nominating = None;
            }
        }
        for id in cancelled {
            self.transactions.take(&id);
        }
        self.evaluate_nomination(now, stream_id, component_id);
        self.update_component_state(stream_id, component_id);
    }

    pub(crate) fn on_gathering_op_done(&mut self, stream_id: StreamId, component_id: ComponentId) {
        if let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        {
            component.gathering.pending = component.gathering.pending.saturating_sub(1);
        }
        self.maybe_finish_gathering(stream_id, component_id);
    }

    fn maybe_finish_gathering(&mut self, stream_id: StreamId, component_id: ComponentId) {
        let ready = self
            .streams
            .get(&stream_id)
            .and_then(|s| s.component(component_id))
            .is_some_and(|c| c.gathering.started && !c.gathering.done && c.gathering.pending == 0);
        if ready {
            self.finish_gathering(stream_id, component_id);
        }
    }

    /// Close gathering for a component, abandoning any server still outstanding
    fn finish_gathering(&mut self, stream_id: StreamId, component_id: ComponentId) {
        let Some(component) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.component_mut(component_id))
        else {
            return;
        };
        component.gathering.done = true;
        component.gathering.deadline = None;
        let abandoned = std::mem::take(&mut component.gathering.pending);
        let candidates = component.local_candidates.len();

        if abandoned > 0 {
            let cancelled = self.transactions.cancel_where(|kind| {
                matches!(kind, TransactionKind::ServerReflexive { stream, component, .. }
                    if *stream == stream_id && *component == component_id)
            });
            let stalled: Vec<usize> = self
                .allocations
                .iter()
                .filter(|(_, a)| {
                    a.stream == stream_id
                        && a.component == component_id
                        && a.gathering_pending
                        && a.state == AllocationState::Requesting
                })
                .map(|(id, _)| *id)
                .collect();
            self.transactions.cancel_where(|kind| {
                matches!(kind, TransactionKind::Turn { allocation, op: TurnOp::Allocate }
                    if stalled.contains(allocation))
            });
            for id in &stalled {
                if let Some(allocation) = self.allocations.get_mut(id) {
                    allocation.gathering_pending = false;
                    allocation.fail();
                }
            }
            warn!(
                "Gathering deadline reached for stream {} component {}: {} server request(s) abandoned",
                stream_id,
                component_id,
                cancelled.len() + stalled.len()
            );
        }

        info!(
            "Gathering complete for stream {} component {} ({} candidates)",
            stream_id, component_id, candidates
        );
        self.events.push_back(IceAgentEvent::GatheringComplete {
            stream_id,
            component_id,
        });
        self.update_component_state(stream_id, component_id);
    }

    pub(crate) fn check_gathering_deadlines(&mut self, now: Instant) {
        let expired: Vec<(StreamId, ComponentId)> = self
            .streams
            .values()
            .flat_map(|s| {
                s.components
                    .iter()
                    .filter(|c| {
                        c.gathering.started
                            && !c.gathering.done
                            && c.gathering.deadline.is_some_and(|d| d <= now)
                    })
                    .map(move |c| (s.id, c.id))
            })
            .collect();
        for (stream_id, component_id) in expired {
            self.finish_gathering(stream_id, component_id);
        }
    }

    /// Send the refreshes that are due
    pub(crate) fn refresh_allocations(&mut self, now: Instant) {
        let due: Vec<(usize, TurnOp)> = self
            .allocations
            .iter_mut()
            .flat_map(|(id, a)| a.due_ops(now).into_iter().map(move |op| (*id, op)))
            .collect();
        for (allocation_id, op) in due {
            self.send_turn_request(now, allocation_id, op);
        }
    }

    /// Release an allocation with a zero-lifetime Refresh. No response is awaited.
    pub(crate) fn release_allocation(&mut self, allocation_id: usize) {
        let id = crate::stun::TransactionId::random(&mut self.rng);
        let Some(allocation) = self.allocations.get_mut(&allocation_id) else {
            return;
        };
        if allocation.relayed().is_none() {
            allocation.state = AllocationState::Released;
            return;
        }
        let mut msg = allocation.build_request(TurnOp::Refresh { lifetime: 0 }, id);
        if let Some(software) = &self.config.software {
            msg.add_attribute(StunAttribute::software(software));
        }
        let transmit = Transmit {
            source: allocation.base,
            destination: allocation.server,
            data: allocation.encode_request(&msg),
        };
        debug!("Releasing TURN allocation on {}", allocation.server);
        allocation.state = AllocationState::Released;
        self.transmits.push_back(transmit);
    }
}
