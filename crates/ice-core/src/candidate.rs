//! ICE candidates
//!
//! A candidate is a transport address a peer may be reachable at. Candidates
//! are immutable once created. They are exchanged with the remote peer as
//! SDP `candidate:` lines.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CandidateType {
    /// Address of a local interface
    Host,
    /// Address seen by a STUN server
    ServerReflexive,
    /// Address learned from a connectivity check
    PeerReflexive,
    /// Address allocated on a TURN server
    Relayed,
}

impl CandidateType {
    /// Type preference (RFC 8445 section 5.1.2.2)
    pub fn preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }

    /// Name used in SDP
    pub fn sdp_name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sdp_name())
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relayed),
            other => Err(Error::MalformedRemoteCandidate(format!(
                "unknown candidate type '{}'",
                other
            ))),
        }
    }
}

/// Transport protocol. Only UDP is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Udp,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// Largest candidate priority a peer may signal (2^31 - 1)
pub const MAX_PRIORITY: u32 = 0x7FFF_FFFF;

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Groups candidates of the same type, base IP and server
    pub foundation: String,
    /// Component id (1-based)
    pub component: u16,
    /// Transport protocol
    pub transport: TransportType,
    /// Candidate priority
    pub priority: u32,
    /// Transport address
    pub address: SocketAddr,
    /// Candidate type
    pub candidate_type: CandidateType,
    /// Address the agent sends from for this candidate
    pub base: SocketAddr,
    /// Related address (base or mapped address) for non-host candidates
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    /// `priority = 2^24 * type_pref + 2^8 * local_pref + (256 - component)`
    pub fn compute_priority(candidate_type: CandidateType, local_preference: u16, component: u16) -> u32 {
        (candidate_type.preference() << 24)
            + ((local_preference as u32) << 8)
            + (256 - component.min(256) as u32)
    }

    /// Create a host candidate
    pub fn host(address: SocketAddr, component: u16, local_preference: u16, foundation: String) -> Self {
        Self {
            foundation,
            component,
            transport: TransportType::Udp,
            priority: Self::compute_priority(CandidateType::Host, local_preference, component),
            address,
            candidate_type: CandidateType::Host,
            base: address,
            related_address: None,
        }
    }

    /// Create a server reflexive candidate
    pub fn server_reflexive(
        address: SocketAddr,
        base: SocketAddr,
        component: u16,
        local_preference: u16,
        foundation: String,
    ) -> Self {
        Self {
            foundation,
            component,
            transport: TransportType::Udp,
            priority: Self::compute_priority(CandidateType::ServerReflexive, local_preference, component),
            address,
            candidate_type: CandidateType::ServerReflexive,
            base,
            related_address: Some(base),
        }
    }

    /// Create a relayed candidate. Its base is the relayed address itself.
    pub fn relayed(
        address: SocketAddr,
        mapped: Option<SocketAddr>,
        component: u16,
        local_preference: u16,
        foundation: String,
    ) -> Self {
        Self {
            foundation,
            component,
            transport: TransportType::Udp,
            priority: Self::compute_priority(CandidateType::Relayed, local_preference, component),
            address,
            candidate_type: CandidateType::Relayed,
            base: address,
            related_address: mapped,
        }
    }

    /// Create a peer reflexive candidate with an explicit priority
    pub fn peer_reflexive(
        address: SocketAddr,
        base: SocketAddr,
        component: u16,
        priority: u32,
        foundation: String,
    ) -> Self {
        Self {
            foundation,
            component,
            transport: TransportType::Udp,
            priority,
            address,
            candidate_type: CandidateType::PeerReflexive,
            base,
            related_address: Some(base),
        }
    }

    /// Local preference encoded in the priority
    pub fn local_preference(&self) -> u16 {
        ((self.priority >> 8) & 0xFFFF) as u16
    }

    /// Priority this candidate would have as a peer reflexive candidate,
    /// sent in the PRIORITY attribute of checks
    pub fn prflx_priority(&self) -> u32 {
        Self::compute_priority(CandidateType::PeerReflexive, self.local_preference(), self.component)
    }

    /// Format as an SDP candidate attribute value (without `a=`)
    pub fn to_sdp_string(&self) -> String {
        let mut s = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type
        );
        if let Some(related) = self.related_address {
            s.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        s
    }

    /// Parse an SDP candidate line.
    ///
    /// Accepts an optional `a=` prefix, an optional `candidate:` prefix, the
    /// transport in any case, and ignores unknown extension attributes.
    pub fn from_sdp_string(s: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedRemoteCandidate(format!("{}: '{}'", reason, s));

        let mut line = s.trim();
        line = line.strip_prefix("a=").unwrap_or(line);
        if let Some(prefix) = line.get(..10) {
            if prefix.eq_ignore_ascii_case("candidate:") {
                line = &line[10..];
            }
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 8 {
            return Err(malformed("too few fields"));
        }

        let foundation = tokens[0];
        if foundation.is_empty() || foundation.len() > 32 {
            return Err(malformed("invalid foundation"));
        }
        let component: u16 = tokens[1].parse().map_err(|_| malformed("invalid component id"))?;
        if !tokens[2].eq_ignore_ascii_case("udp") {
            return Err(malformed("unsupported transport"));
        }
        let priority: u32 = tokens[3].parse().map_err(|_| malformed("invalid priority"))?;
        let ip: IpAddr = tokens[4].parse().map_err(|_| malformed("invalid address"))?;
        let port: u16 = tokens[5].parse().map_err(|_| malformed("invalid port"))?;
        if tokens[6] != "typ" {
            return Err(malformed("missing typ"));
        }
        let candidate_type: CandidateType = tokens[7].parse()?;

        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        let mut rest = tokens[8..].chunks(2);
        while let Some(&[key, value]) = rest.next() {
            match key {
                "raddr" => raddr = Some(value.parse().map_err(|_| malformed("invalid raddr"))?),
                "rport" => rport = Some(value.parse().map_err(|_| malformed("invalid rport"))?),
                _ => {}
            }
        }

        let address = SocketAddr::new(ip, port);
        let candidate = Self {
            foundation: foundation.to_string(),
            component,
            transport: TransportType::Udp,
            priority,
            address,
            candidate_type,
            base: address,
            related_address: match (raddr, rport) {
                (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
                _ => None,
            },
        };
        candidate.validate()?;
        Ok(candidate)
    }

    /// Reject candidates no agent could ever reach
    pub fn validate(&self) -> Result<()> {
        if self.component == 0 || self.component > 256 {
            return Err(Error::MalformedRemoteCandidate(format!(
                "component id {} out of range",
                self.component
            )));
        }
        if self.priority == 0 || self.priority > MAX_PRIORITY {
            return Err(Error::MalformedRemoteCandidate(format!(
                "priority {} outside 1..={}",
                self.priority, MAX_PRIORITY
            )));
        }
        if self.address.port() == 0 {
            return Err(Error::MalformedRemoteCandidate("port must be non-zero".to_string()));
        }
        let ip = self.address.ip();
        if ip.is_unspecified() || ip.is_multicast() {
            return Err(Error::MalformedRemoteCandidate(format!("unusable address {}", ip)));
        }
        Ok(())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sdp_string())
    }
}

impl FromStr for Candidate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_sdp_string(s)
    }
}

/// Assigns foundations.
///
/// Candidates of the same type, base IP and server share a foundation.
/// Foundations are never reassigned for the lifetime of the registry.
#[derive(Debug, Default)]
pub struct FoundationRegistry {
    foundations: HashMap<(CandidateType, IpAddr, Option<SocketAddr>), String>,
    next: u32,
}

impl FoundationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn foundation(&mut self, candidate_type: CandidateType, base_ip: IpAddr, server: Option<SocketAddr>) -> String {
        let next = &mut self.next;
        self.foundations
            .entry((candidate_type, base_ip, server))
            .or_insert_with(|| {
                *next += 1;
                next.to_string()
            })
            .clone()
    }
}
