//! Sans-IO ICE protocol core
//!
//! [`IceSession`] owns every piece of agent state: streams, candidates, check
//! lists, outstanding transactions and TURN allocations. It performs no I/O
//! and never reads the clock. The caller feeds it datagrams
//! ([`handle_receive`](IceSession::handle_receive)) and timer expiries
//! ([`handle_timeout`](IceSession::handle_timeout)) and drains what it
//! produces through the `poll_*` methods.
//!
//! The async [`IceAgent`](crate::agent::IceAgent) drives a session from a
//! single tokio task. Tests drive it directly with virtual time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateType, FoundationRegistry};
use crate::config::{IceConfig, IceRole};
use crate::error::{Error, Result};
use crate::event::{IceAgentEvent, ReceivedData};
use crate::pair::PairId;
use crate::stream::{ComponentId, ComponentState, Credentials, Stream, StreamId, StreamState};
use crate::stun::{
    verify_fingerprint, verify_integrity, PendingTransaction, RetransmitPolicy, StunAttributeType,
    StunClass, StunMessage, StunMethod, TransactionId, TransactionTable, TransactionTimer,
};
use crate::transport::{classify, PacketKind, Transmit};
use crate::turn::{TurnAllocation, TurnOp};

/// What an outstanding transaction is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionKind {
    /// Binding request to a STUN server while gathering
    ServerReflexive {
        stream: StreamId,
        component: ComponentId,
        base: SocketAddr,
        server: SocketAddr,
    },
    /// Request to a TURN server
    Turn { allocation: usize, op: TurnOp },
    /// Connectivity check
    Check {
        stream: StreamId,
        component: ComponentId,
        pair: PairId,
        use_candidate: bool,
        role: IceRole,
    },
}

/// Check pacing: at most one new check per interval for the whole agent
#[derive(Debug, Default)]
pub(crate) struct Pacer {
    pub next_tick: Option<Instant>,
    pub last_sent: Option<Instant>,
    /// Round-robin position over the active check lists
    pub cursor: usize,
}

/// Sans-IO ICE agent state machine
#[derive(Debug)]
pub struct IceSession {
    pub(crate) config: IceConfig,
    pub(crate) rng: StdRng,
    pub(crate) role: IceRole,
    pub(crate) tiebreaker: u64,
    pub(crate) local_credentials: Credentials,
    pub(crate) remote_credentials: Option<Credentials>,
    pub(crate) streams: BTreeMap<StreamId, Stream>,
    next_stream_id: StreamId,
    pub(crate) next_pair_id: u64,
    pub(crate) foundations: FoundationRegistry,
    pub(crate) prflx_count: u32,
    /// Local base (or relayed address) to the component it belongs to
    pub(crate) bases: HashMap<SocketAddr, (StreamId, ComponentId)>,
    pub(crate) transactions: TransactionTable<TransactionKind>,
    pub(crate) allocations: BTreeMap<usize, TurnAllocation>,
    pub(crate) next_allocation: usize,
    pub(crate) pacer: Pacer,
    pub(crate) transmits: VecDeque<Transmit>,
    pub(crate) events: VecDeque<IceAgentEvent>,
    received: VecDeque<ReceivedData>,
    closed: bool,
}

impl IceSession {
    /// Create a session seeded from the OS entropy source
    pub fn new(config: IceConfig) -> Result<Self> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a session with a deterministic random source
    pub fn with_seed(config: IceConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: IceConfig, mut rng: StdRng) -> Result<Self> {
        config.validate()?;
        let tiebreaker = rng.r#gen::<u64>();
        let local_credentials = Credentials::random(&mut rng);
        let role = config.role();
        let policy = RetransmitPolicy::from(&config);

        debug!(
            "Created ICE session: role {}, lite {}, ufrag {}",
            role, config.lite, local_credentials.ufrag
        );

        Ok(Self {
            config,
            rng,
            role,
            tiebreaker,
            local_credentials,
            remote_credentials: None,
            streams: BTreeMap::new(),
            next_stream_id: 1,
            next_pair_id: 0,
            foundations: FoundationRegistry::new(),
            prflx_count: 0,
            bases: HashMap::new(),
            transactions: TransactionTable::new(policy),
            allocations: BTreeMap::new(),
            next_allocation: 0,
            pacer: Pacer::default(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            received: VecDeque::new(),
            closed: false,
        })
    }

    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn tiebreaker(&self) -> u64 {
        self.tiebreaker
    }

    pub fn local_credentials(&self) -> &Credentials {
        &self.local_credentials
    }

    pub fn remote_credentials(&self) -> Option<&Credentials> {
        self.remote_credentials.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Set or clear the SOFTWARE attribute sent in STUN messages
    pub fn set_software(&mut self, software: Option<String>) {
        self.config.software = software;
    }

    /// Add a stream with `components` components (the configured default when `None`)
    pub fn add_stream(&mut self, components: Option<u16>) -> Result<StreamId> {
        if self.closed {
            return Err(Error::AgentClosed);
        }
        let components = components.unwrap_or(self.config.components);
        if components == 0 || components > 256 {
            return Err(Error::InvalidConfig(format!(
                "component count must be within 1..=256, got {}",
                components
            )));
        }
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(id, Stream::new(id, components));
        info!("Created stream {} with {} component(s)", id, components);
        Ok(id)
    }

    /// Remove a stream, cancelling its checks and releasing its TURN
    /// allocations. Returns the local base addresses it used.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Result<Vec<SocketAddr>> {
        if self.streams.remove(&stream_id).is_none() {
            return Err(Error::UnknownStream(stream_id));
        }

        let allocations: Vec<usize> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.stream == stream_id)
            .map(|(id, _)| *id)
            .collect();
        let cancelled = self.transactions.cancel_where(|kind| match kind {
            TransactionKind::ServerReflexive { stream, .. } | TransactionKind::Check { stream, .. } => {
                *stream == stream_id
            }
            TransactionKind::Turn { allocation, .. } => allocations.contains(allocation),
        });
        for id in allocations {
            self.release_allocation(id);
            self.allocations.remove(&id);
        }

        let mut released: Vec<SocketAddr> = self
            .bases
            .iter()
            .filter(|(_, (stream, _))| *stream == stream_id)
            .map(|(addr, _)| *addr)
            .collect();
        released.sort();
        for addr in &released {
            self.bases.remove(addr);
        }

        info!(
            "Removed stream {} ({} transactions cancelled)",
            stream_id,
            cancelled.len()
        );
        Ok(released)
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    fn stream_ref(&self, stream_id: StreamId) -> Result<&Stream> {
        self.streams.get(&stream_id).ok_or(Error::UnknownStream(stream_id))
    }

    pub fn stream_state(&self, stream_id: StreamId) -> Result<StreamState> {
        Ok(self.stream_ref(stream_id)?.state)
    }

    pub fn component_state(&self, stream_id: StreamId, component_id: ComponentId) -> Result<ComponentState> {
        self.stream_ref(stream_id)?
            .component(component_id)
            .map(|c| c.state)
            .ok_or(Error::UnknownComponent {
                stream: stream_id,
                component: component_id,
            })
    }

    /// Local candidates to signal to the peer, for every component of the
    /// stream (peer reflexive candidates are never signalled)
    pub fn local_candidates(&self, stream_id: StreamId) -> Result<Vec<Candidate>> {
        Ok(self
            .stream_ref(stream_id)?
            .components
            .iter()
            .flat_map(|c| c.local_candidates.iter())
            .filter(|c| c.candidate_type != CandidateType::PeerReflexive)
            .cloned()
            .collect())
    }

    /// Local candidates as SDP candidate lines
    pub fn local_candidates_sdp(&self, stream_id: StreamId) -> Result<Vec<String>> {
        Ok(self
            .local_candidates(stream_id)?
            .iter()
            .map(Candidate::to_sdp_string)
            .collect())
    }

    /// Remote candidates known for every component of the stream
    pub fn remote_candidates(&self, stream_id: StreamId) -> Result<Vec<Candidate>> {
        Ok(self
            .stream_ref(stream_id)?
            .components
            .iter()
            .flat_map(|c| c.remote_candidates.iter())
            .cloned()
            .collect())
    }

    /// Nominated pair of a component as (local, remote)
    pub fn selected_pair(
        &self,
        stream_id: StreamId,
        component_id: ComponentId,
    ) -> Result<Option<(Candidate, Candidate)>> {
        let component = self
            .stream_ref(stream_id)?
            .component(component_id)
            .ok_or(Error::UnknownComponent {
                stream: stream_id,
                component: component_id,
            })?;
        Ok(component
            .selected_pair()
            .map(|(local, remote)| (local.clone(), remote.clone())))
    }

    /// Set the credentials of the remote agent. Checks start once these are known.
    pub fn set_remote_credentials(&mut self, now: Instant, ufrag: &str, pwd: &str) {
        debug!("Remote credentials set: ufrag {}", ufrag);
        self.remote_credentials = Some(Credentials::new(ufrag, pwd));
        self.arm_pacer(now);
    }

    /// Add a remote candidate received over signaling
    pub fn add_remote_candidate(&mut self, now: Instant, stream_id: StreamId, candidate: Candidate) -> Result<()> {
        candidate.validate()?;
        let component_id = candidate.component;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let component = stream.component_mut(component_id).ok_or_else(|| {
            Error::MalformedRemoteCandidate(format!(
                "component {} does not exist in stream {}",
                component_id, stream_id
            ))
        })?;

        if let Some(existing) = component
            .remote_candidates
            .iter_mut()
            .find(|c| c.address == candidate.address)
        {
            if existing.candidate_type != CandidateType::PeerReflexive {
                return Ok(());
            }
            // A signalled candidate replaces one learned from a check, in the
            // candidate list and in the pairs already formed with it
            debug!("Signalled candidate {} replaces peer reflexive", candidate.address);
            *existing = candidate.clone();
            let updated = component.checklist.update_remote(&candidate, self.role);
            trace!("{} pair(s) now use signalled candidate {}", updated, candidate.address);
        } else {
            trace!("Remote candidate for stream {}: {}", stream_id, candidate);
            component.remote_candidates.push(candidate);
        }
        self.form_pairs(now, stream_id, component_id);
        Ok(())
    }

    /// Parse and add a remote SDP candidate line
    pub fn add_remote_candidate_sdp(&mut self, now: Instant, stream_id: StreamId, sdp: &str) -> Result<()> {
        let candidate = Candidate::from_sdp_string(sdp).map_err(|e| {
            warn!("Rejected remote candidate: {}", e);
            e
        })?;
        self.add_remote_candidate(now, stream_id, candidate)
    }

    /// Set the role before checks start. Lite agents are always controlled.
    pub fn set_role(&mut self, role: IceRole) -> Result<()> {
        if self.config.lite && role == IceRole::Controlling {
            return Err(Error::InvalidConfig(
                "an ICE-lite agent cannot take the controlling role".to_string(),
            ));
        }
        if role != self.role {
            self.switch_role(role);
        }
        Ok(())
    }

    /// Change role and reprioritise every pair
    pub(crate) fn switch_role(&mut self, role: IceRole) {
        info!("Switching ICE role {} -> {}", self.role, role);
        self.role = role;
        for stream in self.streams.values_mut() {
            for component in &mut stream.components {
                component.checklist.update_priorities(role);
                if role == IceRole::Controlled {
                    component.nominating = None;
                }
            }
        }
    }

    /// Record the IP TOS value for the stream's sockets
    pub fn set_tos(&mut self, stream_id: StreamId, tos: u32) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        stream.tos = Some(tos);
        Ok(())
    }

    /// ICE restart: new local credentials, remote state forgotten, every
    /// check cancelled. Local candidates are kept.
    pub fn restart(&mut self) {
        let cancelled = self
            .transactions
            .cancel_where(|kind| matches!(kind, TransactionKind::Check { .. }));
        info!(
            "ICE restart: {} ({} checks cancelled)",
            Error::AgentRestart,
            cancelled.len()
        );

        self.local_credentials = Credentials::random(&mut self.rng);
        self.remote_credentials = None;
        self.pacer = Pacer {
            last_sent: self.pacer.last_sent,
            ..Pacer::default()
        };

        for stream in self.streams.values_mut() {
            for component in &mut stream.components {
                component.checklist.clear();
                component.remote_candidates.clear();
                component
                    .local_candidates
                    .retain(|c| c.candidate_type != CandidateType::PeerReflexive);
                component.nominated = None;
                component.nominating = None;
                component.first_valid_at = None;
                component.next_keepalive = None;

                let state = if component.gathering.started && !component.gathering.done {
                    ComponentState::Gathering
                } else {
                    ComponentState::New
                };
                if component.state != state {
                    component.state = state;
                    self.events.push_back(IceAgentEvent::ComponentStateChanged {
                        stream_id: stream.id,
                        component_id: component.id,
                        state,
                    });
                }
            }
            if let Some(state) = stream.refresh_state() {
                self.events.push_back(IceAgentEvent::StreamStateChanged {
                    stream_id: stream.id,
                    state,
                });
            }
        }
    }

    /// Send application data over the selected pair of a component
    pub fn send(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId, data: &[u8]) -> Result<usize> {
        let component = self
            .stream_ref(stream_id)?
            .component(component_id)
            .ok_or(Error::UnknownComponent {
                stream: stream_id,
                component: component_id,
            })?;
        if component.state == ComponentState::Failed {
            return Err(Error::ComponentFailed {
                stream: stream_id,
                component: component_id,
            });
        }
        let (local, remote) = component
            .selected_pair()
            .map(|(local, remote)| (local.base, remote.address))
            .ok_or_else(|| Error::InvalidState(format!(
                "stream {} component {} has no selected pair",
                stream_id, component_id
            )))?;

        let transmit = self
            .route(now, local, remote, data)
            .ok_or_else(|| Error::TurnError(format!("no allocation for relayed address {}", local)))?;
        self.transmits.push_back(transmit);
        Ok(data.len())
    }

    /// Stop the agent: release TURN allocations and cancel everything
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let ids: Vec<usize> = self.allocations.keys().copied().collect();
        for id in ids {
            self.release_allocation(id);
        }
        let cancelled = self.transactions.clear();
        self.pacer = Pacer::default();
        self.closed = true;
        info!("ICE session closed ({} transactions cancelled)", cancelled);
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next notification
    pub fn poll_event(&mut self) -> Option<IceAgentEvent> {
        self.events.pop_front()
    }

    /// Next application datagram received
    pub fn poll_data(&mut self) -> Option<ReceivedData> {
        self.received.pop_front()
    }

    /// When [`handle_timeout`](Self::handle_timeout) must next be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        let mut deadline = self.transactions.poll_timeout();
        let mut consider = |at: Option<Instant>| {
            if let Some(at) = at {
                deadline = Some(deadline.map_or(at, |d| d.min(at)));
            }
        };

        consider(self.pacer.next_tick);
        for stream in self.streams.values() {
            for component in &stream.components {
                if component.gathering.started && !component.gathering.done {
                    consider(component.gathering.deadline);
                }
                consider(self.nomination_deadline(component));
                if component.nominated.is_some() {
                    consider(component.next_keepalive);
                }
            }
        }
        for allocation in self.allocations.values() {
            consider(allocation.next_timer());
        }
        deadline
    }

    /// Process every timer due at or before `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        for timer in self.transactions.handle_timeout(now) {
            match timer {
                TransactionTimer::Retransmit(transmit) => self.transmits.push_back(transmit),
                TransactionTimer::Expired(id, pending) => self.on_transaction_timeout(now, id, pending),
            }
        }

        self.check_gathering_deadlines(now);
        self.refresh_allocations(now);
        self.check_nomination_timers(now);
        self.send_keepalives(now);

        if self.pacer.next_tick.is_some_and(|tick| tick <= now) {
            self.on_pacer_tick(now);
        }
    }

    /// Process a datagram received on the local base `local`
    pub fn handle_receive(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, data: &[u8]) {
        if self.closed {
            return;
        }

        if let Some(allocation_id) = self.allocation_for_server(local, from) {
            self.handle_server_packet(now, allocation_id, local, from, data);
            return;
        }
        self.handle_peer_packet(now, local, from, data);
    }

    /// Traffic from a TURN server: our responses, or relayed peer data
    fn handle_server_packet(&mut self, now: Instant, allocation_id: usize, local: SocketAddr, from: SocketAddr, data: &[u8]) {
        let Some(allocation) = self.allocations.get(&allocation_id) else {
            return;
        };
        let relayed = allocation.relayed();

        match classify(data) {
            PacketKind::ChannelData => {
                if let (Some(relayed), Some((peer, payload))) = (relayed, allocation.unwrap_channel_data(data)) {
                    self.handle_peer_packet(now, relayed, peer, &payload);
                }
            }
            PacketKind::Stun => {
                let msg = match StunMessage::decode(data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Dropping malformed message from TURN server {}: {}", from, e);
                        return;
                    }
                };
                if msg.msg_type.class == StunClass::Indication {
                    if let (Some(relayed), Some((peer, payload))) = (relayed, allocation.unwrap_data_indication(&msg)) {
                        self.handle_peer_packet(now, relayed, peer, &payload);
                    }
                } else if msg.msg_type.class.is_response() {
                    self.handle_stun_response(now, local, from, &msg, data);
                }
            }
            PacketKind::Application => {
                trace!("Dropping non-TURN datagram from TURN server {}", from);
            }
        }
    }

    fn handle_peer_packet(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, data: &[u8]) {
        if classify(data) == PacketKind::Stun {
            match StunMessage::decode(data) {
                Ok(msg) => self.handle_stun(now, local, from, &msg, data),
                Err(e) => debug!("Dropping malformed STUN message from {}: {}", from, e),
            }
            return;
        }

        match self.bases.get(&local) {
            Some(&(stream_id, component_id)) => {
                self.received.push_back(ReceivedData {
                    stream_id,
                    component_id,
                    from,
                    data: Bytes::copy_from_slice(data),
                });
            }
            None => trace!("Dropping datagram for unknown local address {}", local),
        }
    }

    fn handle_stun(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, msg: &StunMessage, raw: &[u8]) {
        match (msg.msg_type.method, msg.msg_type.class) {
            (StunMethod::Binding, StunClass::Request) => self.handle_binding_request(now, local, from, msg, raw),
            (_, StunClass::SuccessResponse) | (_, StunClass::ErrorResponse) => {
                self.handle_stun_response(now, local, from, msg, raw)
            }
            (StunMethod::Binding, StunClass::Indication) => trace!("Keepalive from {}", from),
            _ => trace!("Ignoring {:?} from {}", msg.msg_type, from),
        }
    }

    fn handle_stun_response(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, msg: &StunMessage, raw: &[u8]) {
        let id = msg.transaction_id;
        let Some(pending) = self.transactions.get(&id) else {
            trace!("Dropping response to unknown transaction {}", id);
            return;
        };

        if let Some(key) = &pending.integrity_key {
            // TURN challenges (401/438) are not integrity protected
            let unsigned_challenge = matches!(pending.kind, TransactionKind::Turn { .. })
                && msg.msg_type.class == StunClass::ErrorResponse
                && !msg.has_attribute(StunAttributeType::MessageIntegrity);
            if !unsigned_challenge {
                if let Err(e) = verify_integrity(raw, key) {
                    debug!("Dropping response {} from {}: {}", id, from, e);
                    return;
                }
            }
        }
        if let Err(e) = verify_fingerprint(raw) {
            debug!("Dropping response {} from {}: {}", id, from, e);
            return;
        }

        let Some(pending) = self.transactions.take(&id) else {
            return;
        };
        match pending.kind {
            TransactionKind::ServerReflexive {
                stream,
                component,
                base,
                server,
            } => self.on_server_reflexive_response(stream, component, base, server, msg),
            TransactionKind::Turn { allocation, op } => self.on_turn_response(now, allocation, op, msg),
            TransactionKind::Check { .. } => self.on_check_response(now, id, pending, local, from, msg),
        }
    }

    fn on_transaction_timeout(&mut self, now: Instant, id: TransactionId, pending: PendingTransaction<TransactionKind>) {
        match pending.kind {
            TransactionKind::ServerReflexive {
                stream,
                component,
                server,
                ..
            } => {
                warn!(
                    "{}",
                    Error::GatheringError(format!("STUN server {} did not answer", server))
                );
                self.on_gathering_op_done(stream, component);
            }
            TransactionKind::Turn { allocation, op } => self.on_turn_timeout(now, allocation, op),
            TransactionKind::Check {
                stream,
                component,
                pair,
                ..
            } => {
                debug!(
                    "Check {} on {}: {}",
                    id,
                    pair,
                    Error::TransactionTimeout {
                        retransmits: pending.retransmits
                    }
                );
                self.on_check_failed(now, stream, component, pair);
            }
        }
    }

    /// Record a component state change and the resulting stream state.
    /// Backward transitions are refused.
    pub(crate) fn set_component_state(&mut self, stream_id: StreamId, component_id: ComponentId, state: ComponentState) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        let Some(component) = stream.component_mut(component_id) else {
            return false;
        };
        if component.state == state || !component.state.can_transition_to(state) {
            return false;
        }

        info!(
            "Stream {} component {}: {} -> {}",
            stream_id, component_id, component.state, state
        );
        component.state = state;
        self.events.push_back(IceAgentEvent::ComponentStateChanged {
            stream_id,
            component_id,
            state,
        });
        if let Some(stream_state) = stream.refresh_state() {
            info!("Stream {} is now {}", stream_id, stream_state);
            self.events.push_back(IceAgentEvent::StreamStateChanged {
                stream_id,
                state: stream_state,
            });
        }
        true
    }

    /// Build the datagram that carries `data` from a local candidate base to
    /// `destination`, through the TURN server when the base is a relayed address
    pub(crate) fn route(&mut self, now: Instant, local: SocketAddr, destination: SocketAddr, data: &[u8]) -> Option<Transmit> {
        let relay = self
            .allocations
            .iter()
            .find(|(_, a)| a.relayed() == Some(local))
            .map(|(id, _)| *id);

        let Some(allocation_id) = relay else {
            return Some(Transmit {
                source: local,
                destination,
                data: Bytes::copy_from_slice(data),
            });
        };

        let bind = self
            .allocations
            .get_mut(&allocation_id)
            .and_then(|a| a.ensure_channel(destination));
        if let Some(op) = bind {
            self.send_turn_request(now, allocation_id, op);
        }

        let id = TransactionId::random(&mut self.rng);
        let allocation = self.allocations.get(&allocation_id)?;
        Some(Transmit {
            source: allocation.base,
            destination: allocation.server,
            data: allocation.wrap(destination, data, id),
        })
    }

    fn allocation_for_server(&self, local: SocketAddr, from: SocketAddr) -> Option<usize> {
        self.allocations
            .iter()
            .find(|(_, a)| a.base == local && a.server == from)
            .map(|(id, _)| *id)
    }

    /// Schedule a pacing tick unless one is pending
    pub(crate) fn arm_pacer(&mut self, now: Instant) {
        if self.pacer.next_tick.is_some() || self.config.lite {
            return;
        }
        let earliest = self
            .pacer
            .last_sent
            .map_or(now, |last| last + self.config.check_interval());
        self.pacer.next_tick = Some(earliest.max(now));
    }
}
