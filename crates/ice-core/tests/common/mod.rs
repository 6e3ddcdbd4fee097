//! Simulated network for driving sessions with virtual time
//!
//! Datagrams travel with a fixed latency and an optional, seeded loss rate.
//! Addresses can sit behind a 1:1 NAT and address pairs can be blocked.
//! Mock STUN and TURN servers answer from their own addresses.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rvoip_ice_core::stun::{verify_integrity, StunClass, StunMethod};
use rvoip_ice_core::turn::{decode_channel_data, encode_channel_data, long_term_key, PERMISSION_LIFETIME};
use rvoip_ice_core::{
    Candidate, ComponentState, IceAgentEvent, IceConfig, IceSession, ReceivedData, StreamId,
    StreamState, StunAttribute, StunAttributeType, StunMessage, StunMessageType,
};

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Enable log output with RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A datagram in flight
#[derive(Debug, Clone)]
pub struct Packet {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub data: Bytes,
}

/// Something answering on fixed addresses
pub trait Server {
    fn addresses(&self) -> Vec<SocketAddr>;
    fn handle(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, data: &[u8]) -> Vec<Packet>;
}

/// Answers Binding requests with the source address
pub struct StunServer {
    pub address: SocketAddr,
    pub requests: usize,
}

impl StunServer {
    pub fn new(address: SocketAddr) -> Self {
        Self { address, requests: 0 }
    }
}

impl Server for StunServer {
    fn addresses(&self) -> Vec<SocketAddr> {
        vec![self.address]
    }

    fn handle(&mut self, _now: Instant, local: SocketAddr, from: SocketAddr, data: &[u8]) -> Vec<Packet> {
        let Ok(request) = StunMessage::decode(data) else {
            return Vec::new();
        };
        if request.msg_type != StunMessageType::BINDING_REQUEST {
            return Vec::new();
        }
        self.requests += 1;
        let mut response = StunMessage::success_response(&request);
        response.add_attribute(StunAttribute::xor_mapped_address(from, &request.transaction_id));
        vec![Packet {
            source: local,
            destination: from,
            data: response.encode_with_fingerprint(),
        }]
    }
}

/// What a [`TurnServer`] saw, readable after the server is handed to the network
#[derive(Debug, Default)]
pub struct TurnStats {
    pub challenges: usize,
    pub refreshes: usize,
    pub channel_binds: usize,
    /// Refreshes answered with 437 while `reject_refresh` is set
    pub rejected_refreshes: usize,
    /// Relayed datagrams dropped for lack of a permission
    pub unpermitted: usize,
    pub released: bool,
    /// Answer Refresh requests with 437 Allocation Mismatch
    pub reject_refresh: bool,
}

/// TURN server holding a single allocation. Permissions are installed by
/// ChannelBind and expire after five minutes.
pub struct TurnServer {
    pub address: SocketAddr,
    pub relayed: SocketAddr,
    username: String,
    password: String,
    realm: String,
    nonce: String,
    client: Option<SocketAddr>,
    channels: HashMap<u16, SocketAddr>,
    permissions: HashMap<IpAddr, Instant>,
    stats: Rc<RefCell<TurnStats>>,
}

impl TurnServer {
    pub fn new(address: SocketAddr, relayed: SocketAddr, username: &str, password: &str) -> Self {
        Self {
            address,
            relayed,
            username: username.to_string(),
            password: password.to_string(),
            realm: "example.org".to_string(),
            nonce: "f00dcafe".to_string(),
            client: None,
            channels: HashMap::new(),
            permissions: HashMap::new(),
            stats: Rc::default(),
        }
    }

    pub fn stats(&self) -> Rc<RefCell<TurnStats>> {
        self.stats.clone()
    }

    fn permitted(&mut self, now: Instant, peer: SocketAddr) -> bool {
        let permitted = self
            .permissions
            .get(&peer.ip())
            .is_some_and(|installed| now < *installed + PERMISSION_LIFETIME);
        if !permitted {
            self.stats.borrow_mut().unpermitted += 1;
        }
        permitted
    }

    fn key(&self) -> Vec<u8> {
        long_term_key(&self.username, &self.realm, &self.password)
    }

    fn from_client(&mut self, now: Instant, from: SocketAddr, data: &[u8]) -> Vec<Packet> {
        if let Some((channel, payload)) = decode_channel_data(data) {
            return match self.channels.get(&channel).copied() {
                Some(peer) if self.permitted(now, peer) => vec![Packet {
                    source: self.relayed,
                    destination: peer,
                    data: payload,
                }],
                _ => Vec::new(),
            };
        }

        let Ok(msg) = StunMessage::decode(data) else {
            return Vec::new();
        };
        if msg.msg_type.class == StunClass::Indication {
            if msg.msg_type.method != StunMethod::Send {
                return Vec::new();
            }
            let peer = msg
                .get_attribute(StunAttributeType::XorPeerAddress)
                .and_then(|a| a.as_xor_address(&msg.transaction_id).ok());
            let payload = msg.get_attribute(StunAttributeType::Data).map(|a| a.value.clone());
            return match (peer, payload) {
                (Some(peer), Some(payload)) => vec![Packet {
                    source: self.relayed,
                    destination: peer,
                    data: payload,
                }],
                _ => Vec::new(),
            };
        }
        if msg.msg_type.class != StunClass::Request {
            return Vec::new();
        }

        let address = self.address;
        let reply = move |data: Bytes| {
            vec![Packet {
                source: address,
                destination: from,
                data,
            }]
        };

        if !msg.has_attribute(StunAttributeType::MessageIntegrity) {
            self.stats.borrow_mut().challenges += 1;
            let mut response = StunMessage::error_response(&msg, 401, "Unauthorized");
            response.add_attribute(StunAttribute::realm(&self.realm));
            response.add_attribute(StunAttribute::nonce(&self.nonce));
            return reply(response.encode());
        }
        let key = self.key();
        if verify_integrity(data, &key).is_err() {
            self.stats.borrow_mut().challenges += 1;
            let mut response = StunMessage::error_response(&msg, 401, "Unauthorized");
            response.add_attribute(StunAttribute::realm(&self.realm));
            response.add_attribute(StunAttribute::nonce(&self.nonce));
            return reply(response.encode());
        }

        let mut response = StunMessage::success_response(&msg);
        match msg.msg_type.method {
            StunMethod::Allocate => {
                self.client = Some(from);
                response.add_attribute(StunAttribute::xor_relayed_address(self.relayed, &msg.transaction_id));
                response.add_attribute(StunAttribute::xor_mapped_address(from, &msg.transaction_id));
                response.add_attribute(StunAttribute::lifetime(600));
            }
            StunMethod::Refresh => {
                let lifetime = msg
                    .get_attribute(StunAttributeType::Lifetime)
                    .and_then(|a| a.as_u32().ok())
                    .unwrap_or(600);
                let mut stats = self.stats.borrow_mut();
                if lifetime == 0 {
                    stats.released = true;
                } else if stats.reject_refresh {
                    stats.rejected_refreshes += 1;
                    let response = StunMessage::error_response(&msg, 437, "Allocation Mismatch");
                    return reply(response.encode_with_integrity(&key));
                } else {
                    stats.refreshes += 1;
                }
                response.add_attribute(StunAttribute::lifetime(lifetime));
            }
            StunMethod::ChannelBind => {
                let channel = msg
                    .get_attribute(StunAttributeType::ChannelNumber)
                    .and_then(|a| a.as_channel_number().ok());
                let peer = msg
                    .get_attribute(StunAttributeType::XorPeerAddress)
                    .and_then(|a| a.as_xor_address(&msg.transaction_id).ok());
                if let (Some(channel), Some(peer)) = (channel, peer) {
                    self.channels.insert(channel, peer);
                    self.permissions.insert(peer.ip(), now);
                    self.stats.borrow_mut().channel_binds += 1;
                }
            }
            _ => return Vec::new(),
        }
        reply(response.encode_with_integrity(&key))
    }

    fn from_peer(&mut self, now: Instant, from: SocketAddr, data: &[u8]) -> Vec<Packet> {
        let Some(client) = self.client else {
            return Vec::new();
        };
        if !self.permitted(now, from) {
            return Vec::new();
        }
        let framed = match self.channels.iter().find(|(_, peer)| **peer == from) {
            Some((channel, _)) => encode_channel_data(*channel, data),
            None => {
                let mut indication = StunMessage::new(StunMessageType::new(StunMethod::Data, StunClass::Indication));
                let tid = indication.transaction_id;
                indication.add_attribute(StunAttribute::xor_peer_address(from, &tid));
                indication.add_attribute(StunAttribute::data(Bytes::copy_from_slice(data)));
                indication.encode()
            }
        };
        vec![Packet {
            source: self.address,
            destination: client,
            data: framed,
        }]
    }
}

impl Server for TurnServer {
    fn addresses(&self) -> Vec<SocketAddr> {
        vec![self.address, self.relayed]
    }

    fn handle(&mut self, now: Instant, local: SocketAddr, from: SocketAddr, data: &[u8]) -> Vec<Packet> {
        if local == self.relayed {
            self.from_peer(now, from, data)
        } else {
            self.from_client(now, from, data)
        }
    }
}

/// One simulated agent
pub struct Peer {
    pub session: IceSession,
    pub stream: StreamId,
    pub bases: Vec<SocketAddr>,
    pub events: Vec<IceAgentEvent>,
    pub data: Vec<ReceivedData>,
}

impl Peer {
    pub fn component_state(&self, component: u16) -> ComponentState {
        self.session.component_state(self.stream, component).unwrap()
    }

    pub fn stream_state(&self) -> StreamState {
        self.session.stream_state(self.stream).unwrap()
    }

    pub fn is_completed(&self) -> bool {
        self.stream_state() == StreamState::Completed
    }

    pub fn gathering_complete(&self) -> bool {
        let components = self.session.stream(self.stream).unwrap().components.len();
        self.events
            .iter()
            .filter(|e| matches!(e, IceAgentEvent::GatheringComplete { .. }))
            .count()
            >= components
    }

    pub fn selected(&self, component: u16) -> Option<(SocketAddr, SocketAddr)> {
        self.session
            .selected_pair(self.stream, component)
            .unwrap()
            .map(|(local, remote)| (local.address, remote.address))
    }
}

struct InFlight {
    at: Instant,
    seq: u64,
    packet: Packet,
}

/// The simulated network
pub struct Network {
    pub start: Instant,
    pub now: Instant,
    pub latency: Duration,
    pub loss: f64,
    rng: StdRng,
    seq: u64,
    in_flight: Vec<InFlight>,
    pub peers: Vec<Peer>,
    servers: Vec<Box<dyn Server>>,
    /// Private address to public address
    nat: HashMap<SocketAddr, SocketAddr>,
    blocked: HashSet<(SocketAddr, SocketAddr)>,
    /// Binding indications delivered to each peer address
    pub indications: HashMap<SocketAddr, usize>,
}

impl Network {
    pub fn new(seed: u64) -> Self {
        let start = Instant::now();
        Self {
            start,
            now: start,
            latency: Duration::from_millis(10),
            loss: 0.0,
            rng: StdRng::seed_from_u64(seed),
            seq: 0,
            in_flight: Vec::new(),
            peers: Vec::new(),
            servers: Vec::new(),
            nat: HashMap::new(),
            blocked: HashSet::new(),
            indications: HashMap::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    pub fn add_server(&mut self, server: Box<dyn Server>) {
        self.servers.push(server);
    }

    /// Place `private` behind a NAT that maps it to `public`
    pub fn add_nat(&mut self, private: SocketAddr, public: SocketAddr) {
        self.nat.insert(private, public);
    }

    /// Drop everything exchanged between two addresses
    pub fn block(&mut self, a: SocketAddr, b: SocketAddr) {
        self.blocked.insert((a, b));
        self.blocked.insert((b, a));
    }

    /// Create a session with one stream and start gathering on `bases`
    pub fn add_peer(&mut self, config: IceConfig, seed: u64, bases: &[(u16, SocketAddr)]) -> usize {
        let components = config.components;
        let mut session = IceSession::with_seed(config, seed).unwrap();
        let stream = session.add_stream(Some(components)).unwrap();
        session.gather_candidates(self.now, stream, bases).unwrap();
        self.peers.push(Peer {
            session,
            stream,
            bases: bases.iter().map(|(_, a)| *a).collect(),
            events: Vec::new(),
            data: Vec::new(),
        });
        self.drain();
        self.peers.len() - 1
    }

    /// Give `to` the credentials and the candidates of `from` accepted by `filter`
    pub fn signal<F>(&mut self, from: usize, to: usize, filter: F)
    where
        F: Fn(&Candidate) -> bool,
    {
        let credentials = self.peers[from].session.local_credentials().clone();
        let candidates = self.peers[from]
            .session
            .local_candidates(self.peers[from].stream)
            .unwrap();
        let now = self.now;
        let peer = &mut self.peers[to];
        peer.session.set_remote_credentials(now, &credentials.ufrag, &credentials.pwd);
        for candidate in candidates.into_iter().filter(|c| filter(c)) {
            peer.session.add_remote_candidate(now, peer.stream, candidate).unwrap();
        }
        self.drain();
    }

    /// Signal every candidate in both directions
    pub fn connect(&mut self, a: usize, b: usize) {
        self.signal(a, b, |_| true);
        self.signal(b, a, |_| true);
    }

    fn send(&mut self, mut packet: Packet) {
        if let Some(public) = self.nat.get(&packet.source) {
            packet.source = *public;
        }
        if self.blocked.contains(&(packet.source, packet.destination)) {
            return;
        }
        // Private addresses cannot be reached from outside the NAT
        if self.nat.contains_key(&packet.destination) {
            return;
        }
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            return;
        }
        self.seq += 1;
        self.in_flight.push(InFlight {
            at: self.now + self.latency,
            seq: self.seq,
            packet,
        });
    }

    /// Move everything the sessions produced onto the wire
    fn drain(&mut self) {
        let mut outgoing = Vec::new();
        for peer in &mut self.peers {
            while let Some(transmit) = peer.session.poll_transmit() {
                outgoing.push(Packet {
                    source: transmit.source,
                    destination: transmit.destination,
                    data: transmit.data,
                });
            }
            while let Some(event) = peer.session.poll_event() {
                peer.events.push(event);
            }
            while let Some(data) = peer.session.poll_data() {
                peer.data.push(data);
            }
        }
        for packet in outgoing {
            self.send(packet);
        }
    }

    fn deliver(&mut self, mut packet: Packet) {
        if let Some(index) = self
            .servers
            .iter()
            .position(|s| s.addresses().contains(&packet.destination))
        {
            let now = self.now;
            let replies = self.servers[index].handle(now, packet.destination, packet.source, &packet.data);
            for reply in replies {
                self.send(reply);
            }
            return;
        }

        if let Some((private, _)) = self.nat.iter().find(|(_, public)| **public == packet.destination) {
            packet.destination = *private;
        }
        let is_indication = StunMessage::decode(&packet.data)
            .is_ok_and(|msg| msg.msg_type == StunMessageType::BINDING_INDICATION);
        if is_indication {
            *self.indications.entry(packet.destination).or_default() += 1;
        }
        let now = self.now;
        if let Some(peer) = self
            .peers
            .iter_mut()
            .find(|p| p.bases.contains(&packet.destination))
        {
            peer.session
                .handle_receive(now, packet.destination, packet.source, &packet.data);
        }
    }

    /// Advance virtual time until `done` holds or `limit` elapses
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Network) -> bool,
    {
        let deadline = self.now + limit;
        loop {
            self.drain();
            if done(self) {
                return true;
            }

            let next_packet = self.in_flight.iter().map(|p| p.at).min();
            let next_timer = self.peers.iter().filter_map(|p| p.session.poll_timeout()).min();
            let next = match (next_packet, next_timer) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => return false,
            };
            if next > deadline {
                self.now = deadline;
                return false;
            }
            self.now = self.now.max(next);

            let now = self.now;
            let mut due: Vec<InFlight> = Vec::new();
            let mut index = 0;
            while index < self.in_flight.len() {
                if self.in_flight[index].at <= now {
                    due.push(self.in_flight.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due.sort_by_key(|p| (p.at, p.seq));
            for in_flight in due {
                self.deliver(in_flight.packet);
            }

            for peer in &mut self.peers {
                if peer.session.poll_timeout().is_some_and(|at| at <= now) {
                    peer.session.handle_timeout(now);
                }
            }
        }
    }

    /// Run until both peers complete
    pub fn run_to_completion(&mut self, a: usize, b: usize, limit: Duration) -> bool {
        self.run_until(limit, |net| net.peers[a].is_completed() && net.peers[b].is_completed())
    }
}
