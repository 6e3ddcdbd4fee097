//! TURN client allocations (RFC 8656)
//!
//! A [`TurnAllocation`] is the client side of one allocation on one TURN
//! server, bound to one local base of one component. It builds requests and
//! interprets responses; the session owns the transactions and the clock.
//!
//! Authentication uses the long-term credential mechanism: the first
//! Allocate is sent without credentials, the server challenges with 401 and
//! a REALM/NONCE, and every later request carries USERNAME, REALM, NONCE and
//! MESSAGE-INTEGRITY keyed with `MD5(username:realm:password)`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::config::TurnServerConfig;
use crate::stun::{
    StunAttribute, StunAttributeType, StunClass, StunMessage, StunMessageType, StunMethod,
    TransactionId,
};

/// Lifetime asked for in Allocate and Refresh requests
pub const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);

/// Lifetime of the permission a ChannelBind installs for its peer
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Rebinding a channel refreshes the channel and its permission together.
/// Permissions expire first, so the rebind follows their lifetime.
const CHANNEL_REFRESH: Duration = Duration::from_secs(240);

/// Valid channel numbers
const CHANNEL_MIN: u16 = 0x4000;
const CHANNEL_MAX: u16 = 0x4FFF;

/// Authentication retries before the allocation gives up
const MAX_AUTH_ATTEMPTS: u8 = 3;

/// `MD5(username ":" realm ":" password)`
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password).as_bytes());
    hasher.finalize().to_vec()
}

/// Frame application data as TURN ChannelData
pub fn encode_channel_data(channel: u16, data: &[u8]) -> Bytes {
    let padded = (data.len() + 3) & !3;
    let mut buf = BytesMut::with_capacity(4 + padded);
    buf.put_u16(channel);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    buf.put_bytes(0, padded - data.len());
    buf.freeze()
}

/// Split a ChannelData message into (channel, payload)
pub fn decode_channel_data(data: &[u8]) -> Option<(u16, Bytes)> {
    if data.len() < 4 {
        return None;
    }
    let channel = BigEndian::read_u16(&data[0..2]);
    let length = BigEndian::read_u16(&data[2..4]) as usize;
    if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) || data.len() < 4 + length {
        return None;
    }
    Some((channel, Bytes::copy_from_slice(&data[4..4 + length])))
}

/// Request kinds sent to a TURN server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnOp {
    Allocate,
    Refresh { lifetime: u32 },
    ChannelBind { peer: SocketAddr, channel: u16 },
}

/// Allocation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// Allocate outstanding
    Requesting,
    /// Relayed address in use
    Allocated {
        relayed: SocketAddr,
        mapped: Option<SocketAddr>,
    },
    /// Allocation could not be obtained or was lost
    Failed,
    /// Released by the client
    Released,
}

/// Outcome of a TURN response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing further to do
    Done,
    /// Credentials changed; resend the same operation
    Retry,
    /// Allocate succeeded
    Allocated {
        relayed: SocketAddr,
        mapped: Option<SocketAddr>,
    },
    /// The operation failed
    Failed(String),
}

#[derive(Debug, Clone)]
struct Channel {
    number: u16,
    bound: bool,
    refresh_at: Option<Instant>,
}

/// Client side of one TURN allocation
#[derive(Debug)]
pub struct TurnAllocation {
    pub stream: u32,
    pub component: u16,
    /// TURN server address
    pub server: SocketAddr,
    /// Local base the allocation is reached from
    pub base: SocketAddr,
    pub state: AllocationState,
    /// Allocate has not yet produced a result for candidate gathering
    pub(crate) gathering_pending: bool,
    /// Relay candidate advertised for this allocation
    pub(crate) relay_candidate: Option<SocketAddr>,
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
    key: Option<Vec<u8>>,
    auth_attempts: u8,
    refresh_at: Option<Instant>,
    channels: HashMap<SocketAddr, Channel>,
    next_channel: u16,
}

impl TurnAllocation {
    pub fn new(stream: u32, component: u16, base: SocketAddr, server: &TurnServerConfig) -> Self {
        Self {
            stream,
            component,
            server: server.address,
            base,
            state: AllocationState::Requesting,
            gathering_pending: true,
            relay_candidate: None,
            username: server.username.clone(),
            password: server.password.clone(),
            realm: None,
            nonce: None,
            key: None,
            auth_attempts: 0,
            refresh_at: None,
            channels: HashMap::new(),
            next_channel: CHANNEL_MIN,
        }
    }

    /// Relayed transport address once allocated
    pub fn relayed(&self) -> Option<SocketAddr> {
        match self.state {
            AllocationState::Allocated { relayed, .. } => Some(relayed),
            _ => None,
        }
    }

    /// Key that authenticates responses, once the server has challenged us
    pub fn integrity_key(&self) -> Option<Vec<u8>> {
        self.key.clone()
    }

    /// Build the request for `op`
    pub fn build_request(&self, op: TurnOp, id: TransactionId) -> StunMessage {
        let method = match op {
            TurnOp::Allocate => StunMethod::Allocate,
            TurnOp::Refresh { .. } => StunMethod::Refresh,
            TurnOp::ChannelBind { .. } => StunMethod::ChannelBind,
        };
        let mut msg = StunMessage::with_transaction_id(StunMessageType::new(method, StunClass::Request), id);

        match op {
            TurnOp::Allocate => {
                msg.add_attribute(StunAttribute::requested_transport_udp());
                msg.add_attribute(StunAttribute::lifetime(DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32));
            }
            TurnOp::Refresh { lifetime } => {
                msg.add_attribute(StunAttribute::lifetime(lifetime));
            }
            TurnOp::ChannelBind { peer, channel } => {
                msg.add_attribute(StunAttribute::channel_number(channel));
                msg.add_attribute(StunAttribute::xor_peer_address(peer, &id));
            }
        }

        if let (Some(realm), Some(nonce)) = (&self.realm, &self.nonce) {
            msg.add_attribute(StunAttribute::username(&self.username));
            msg.add_attribute(StunAttribute::realm(realm));
            msg.add_attribute(StunAttribute::nonce(nonce));
        }
        msg
    }

    /// Encode a request, signing it once credentials are known
    pub fn encode_request(&self, msg: &StunMessage) -> Bytes {
        match &self.key {
            Some(key) => msg.encode_with_integrity(key),
            None => msg.encode(),
        }
    }

    /// Interpret the response to `op`
    pub fn handle_response(&mut self, now: Instant, op: TurnOp, msg: &StunMessage) -> TurnOutcome {
        if msg.msg_type.class == StunClass::ErrorResponse {
            let code = msg.error_code().unwrap_or(0);
            return self.handle_error(op, code, msg);
        }
        self.auth_attempts = 0;

        match op {
            TurnOp::Allocate => {
                let relayed = match msg
                    .get_attribute(StunAttributeType::XorRelayedAddress)
                    .map(|attr| attr.as_xor_address(&msg.transaction_id))
                {
                    Some(Ok(addr)) => addr,
                    _ => {
                        self.state = AllocationState::Failed;
                        return TurnOutcome::Failed("Allocate response without XOR-RELAYED-ADDRESS".to_string());
                    }
                };
                let mapped = msg.mapped_address();
                self.state = AllocationState::Allocated { relayed, mapped };
                self.schedule_refresh(now, response_lifetime(msg));
                debug!("TURN allocation on {} relays via {}", self.server, relayed);
                TurnOutcome::Allocated { relayed, mapped }
            }
            TurnOp::Refresh { lifetime: 0 } => {
                self.state = AllocationState::Released;
                self.refresh_at = None;
                TurnOutcome::Done
            }
            TurnOp::Refresh { .. } => {
                self.schedule_refresh(now, response_lifetime(msg));
                TurnOutcome::Done
            }
            TurnOp::ChannelBind { peer, channel } => {
                if let Some(entry) = self.channels.get_mut(&peer) {
                    if entry.number == channel {
                        entry.bound = true;
                        entry.refresh_at = Some(now + CHANNEL_REFRESH);
                    }
                }
                TurnOutcome::Done
            }
        }
    }

    fn handle_error(&mut self, op: TurnOp, code: u16, msg: &StunMessage) -> TurnOutcome {
        let challenge = code == 401 || code == 438;
        if challenge && self.auth_attempts < MAX_AUTH_ATTEMPTS {
            let realm = msg
                .get_attribute(StunAttributeType::Realm)
                .and_then(|attr| attr.as_string().ok())
                .or_else(|| self.realm.clone());
            let nonce = msg
                .get_attribute(StunAttributeType::Nonce)
                .and_then(|attr| attr.as_string().ok());
            if let (Some(realm), Some(nonce)) = (realm, nonce) {
                self.key = Some(long_term_key(&self.username, &realm, &self.password));
                self.realm = Some(realm);
                self.nonce = Some(nonce);
                self.auth_attempts += 1;
                return TurnOutcome::Retry;
            }
        }

        let reason = format!("{:?} rejected by {} with error {}", op, self.server, code);
        match op {
            TurnOp::Allocate | TurnOp::Refresh { .. } => {
                warn!("{}", reason);
                self.state = AllocationState::Failed;
                self.refresh_at = None;
            }
            TurnOp::ChannelBind { peer, .. } => {
                debug!("{}", reason);
                self.channels.remove(&peer);
            }
        }
        TurnOutcome::Failed(reason)
    }

    fn schedule_refresh(&mut self, now: Instant, lifetime: Duration) {
        let margin = if lifetime > Duration::from_secs(120) {
            Duration::from_secs(60)
        } else {
            lifetime / 2
        };
        self.refresh_at = Some(now + lifetime - margin);
    }

    /// Mark the allocation lost (refresh exhausted its retransmissions)
    pub fn fail(&mut self) {
        self.state = AllocationState::Failed;
        self.refresh_at = None;
        self.channels.clear();
    }

    /// Drop a channel whose binding never completed
    pub fn forget_channel(&mut self, peer: SocketAddr) {
        self.channels.remove(&peer);
    }

    /// Next refresh deadline
    pub fn next_timer(&self) -> Option<Instant> {
        if self.relayed().is_none() {
            return None;
        }
        self.channels
            .values()
            .filter_map(|c| c.refresh_at)
            .chain(self.refresh_at)
            .min()
    }

    /// Operations due at `now`. Each deadline is cleared until its response
    /// schedules the next one.
    pub fn due_ops(&mut self, now: Instant) -> Vec<TurnOp> {
        let mut ops = Vec::new();
        if self.relayed().is_none() {
            return ops;
        }
        if self.refresh_at.is_some_and(|at| at <= now) {
            self.refresh_at = None;
            ops.push(TurnOp::Refresh {
                lifetime: DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32,
            });
        }
        let mut peers: Vec<(&SocketAddr, &mut Channel)> = self
            .channels
            .iter_mut()
            .filter(|(_, c)| c.refresh_at.is_some_and(|at| at <= now))
            .collect();
        peers.sort_by_key(|(_, c)| c.number);
        for (peer, channel) in peers {
            channel.refresh_at = None;
            ops.push(TurnOp::ChannelBind {
                peer: *peer,
                channel: channel.number,
            });
        }
        ops
    }

    /// Reserve a channel for `peer`. Returns the ChannelBind to send when the
    /// peer has no channel yet.
    pub fn ensure_channel(&mut self, peer: SocketAddr) -> Option<TurnOp> {
        if self.relayed().is_none() || self.channels.contains_key(&peer) {
            return None;
        }
        if self.next_channel > CHANNEL_MAX {
            return None;
        }
        let number = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(
            peer,
            Channel {
                number,
                bound: false,
                refresh_at: None,
            },
        );
        Some(TurnOp::ChannelBind { peer, channel: number })
    }

    /// Wrap data for `peer`: ChannelData once the channel is bound, a Send
    /// indication before that
    pub fn wrap(&self, peer: SocketAddr, data: &[u8], id: TransactionId) -> Bytes {
        if let Some(channel) = self.channels.get(&peer).filter(|c| c.bound) {
            return encode_channel_data(channel.number, data);
        }
        let mut msg = StunMessage::with_transaction_id(
            StunMessageType::new(StunMethod::Send, StunClass::Indication),
            id,
        );
        msg.add_attribute(StunAttribute::xor_peer_address(peer, &id));
        msg.add_attribute(StunAttribute::data(Bytes::copy_from_slice(data)));
        msg.encode()
    }

    /// Unwrap a Data indication from the server into (peer, payload)
    pub fn unwrap_data_indication(&self, msg: &StunMessage) -> Option<(SocketAddr, Bytes)> {
        if msg.msg_type != StunMessageType::new(StunMethod::Data, StunClass::Indication) {
            return None;
        }
        let peer = msg
            .get_attribute(StunAttributeType::XorPeerAddress)?
            .as_xor_address(&msg.transaction_id)
            .ok()?;
        let data = msg.get_attribute(StunAttributeType::Data)?.value.clone();
        Some((peer, data))
    }

    /// Unwrap ChannelData from the server into (peer, payload)
    pub fn unwrap_channel_data(&self, data: &[u8]) -> Option<(SocketAddr, Bytes)> {
        let (number, payload) = decode_channel_data(data)?;
        self.channels
            .iter()
            .find(|(_, c)| c.number == number)
            .map(|(peer, _)| (*peer, payload))
    }
}

fn response_lifetime(msg: &StunMessage) -> Duration {
    msg.get_attribute(StunAttributeType::Lifetime)
        .and_then(|attr| attr.as_u32().ok())
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(DEFAULT_ALLOCATION_LIFETIME)
}
