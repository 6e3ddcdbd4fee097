use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use super::message::TransactionId;
use super::STUN_MAGIC_COOKIE;
use crate::error::{Error, Result};

/// STUN attribute types used by ICE (RFC 8445), STUN (RFC 5389) and TURN (RFC 8656)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunAttributeType {
    MappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ChannelNumber,
    Lifetime,
    XorPeerAddress,
    Data,
    Realm,
    Nonce,
    XorRelayedAddress,
    RequestedTransport,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Software,
    Fingerprint,
    IceControlled,
    IceControlling,
    /// Any attribute this agent does not interpret
    Other(u16),
}

impl From<u16> for StunAttributeType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0019 => Self::RequestedTransport,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            other => Self::Other(other),
        }
    }
}

impl From<StunAttributeType> for u16 {
    fn from(attr_type: StunAttributeType) -> Self {
        match attr_type {
            StunAttributeType::MappedAddress => 0x0001,
            StunAttributeType::Username => 0x0006,
            StunAttributeType::MessageIntegrity => 0x0008,
            StunAttributeType::ErrorCode => 0x0009,
            StunAttributeType::UnknownAttributes => 0x000A,
            StunAttributeType::ChannelNumber => 0x000C,
            StunAttributeType::Lifetime => 0x000D,
            StunAttributeType::XorPeerAddress => 0x0012,
            StunAttributeType::Data => 0x0013,
            StunAttributeType::Realm => 0x0014,
            StunAttributeType::Nonce => 0x0015,
            StunAttributeType::XorRelayedAddress => 0x0016,
            StunAttributeType::RequestedTransport => 0x0019,
            StunAttributeType::XorMappedAddress => 0x0020,
            StunAttributeType::Priority => 0x0024,
            StunAttributeType::UseCandidate => 0x0025,
            StunAttributeType::Software => 0x8022,
            StunAttributeType::Fingerprint => 0x8028,
            StunAttributeType::IceControlled => 0x8029,
            StunAttributeType::IceControlling => 0x802A,
            StunAttributeType::Other(value) => value,
        }
    }
}

/// UDP protocol number carried in REQUESTED-TRANSPORT
const PROTOCOL_UDP: u8 = 17;

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    /// Attribute type
    pub attr_type: StunAttributeType,
    /// Attribute value (unpadded)
    pub value: Bytes,
}

impl StunAttribute {
    /// Create a new attribute
    pub fn new(attr_type: StunAttributeType, value: Bytes) -> Self {
        Self { attr_type, value }
    }

    /// Create an XOR-encoded address attribute (XOR-MAPPED-ADDRESS,
    /// XOR-PEER-ADDRESS or XOR-RELAYED-ADDRESS)
    pub fn xor_address(attr_type: StunAttributeType, addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        let mut value = BytesMut::with_capacity(20);

        // Reserved byte, then the address family
        value.put_u8(0);
        value.put_u8(match addr.ip() {
            IpAddr::V4(_) => 1,
            IpAddr::V6(_) => 2,
        });
        value.put_u16(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);

        match addr.ip() {
            IpAddr::V4(ipv4) => {
                value.put_u32(u32::from_be_bytes(ipv4.octets()) ^ STUN_MAGIC_COOKIE);
            }
            IpAddr::V6(ipv6) => {
                let key = xor_key(transaction_id);
                let octets = ipv6.octets();
                for i in 0..16 {
                    value.put_u8(octets[i] ^ key[i]);
                }
            }
        }

        Self::new(attr_type, value.freeze())
    }

    /// Create a XOR-MAPPED-ADDRESS attribute
    pub fn xor_mapped_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::xor_address(StunAttributeType::XorMappedAddress, addr, transaction_id)
    }

    /// Create a XOR-PEER-ADDRESS attribute
    pub fn xor_peer_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::xor_address(StunAttributeType::XorPeerAddress, addr, transaction_id)
    }

    /// Create a XOR-RELAYED-ADDRESS attribute
    pub fn xor_relayed_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::xor_address(StunAttributeType::XorRelayedAddress, addr, transaction_id)
    }

    /// Create a USERNAME attribute
    pub fn username(username: &str) -> Self {
        Self::new(StunAttributeType::Username, Bytes::copy_from_slice(username.as_bytes()))
    }

    /// Create a SOFTWARE attribute
    pub fn software(software: &str) -> Self {
        Self::new(StunAttributeType::Software, Bytes::copy_from_slice(software.as_bytes()))
    }

    /// Create a REALM attribute
    pub fn realm(realm: &str) -> Self {
        Self::new(StunAttributeType::Realm, Bytes::copy_from_slice(realm.as_bytes()))
    }

    /// Create a NONCE attribute
    pub fn nonce(nonce: &str) -> Self {
        Self::new(StunAttributeType::Nonce, Bytes::copy_from_slice(nonce.as_bytes()))
    }

    /// Create a PRIORITY attribute
    pub fn priority(priority: u32) -> Self {
        Self::new(StunAttributeType::Priority, Bytes::copy_from_slice(&priority.to_be_bytes()))
    }

    /// Create a USE-CANDIDATE attribute
    pub fn use_candidate() -> Self {
        Self::new(StunAttributeType::UseCandidate, Bytes::new())
    }

    /// Create an ICE-CONTROLLING attribute
    pub fn ice_controlling(tiebreaker: u64) -> Self {
        Self::new(StunAttributeType::IceControlling, Bytes::copy_from_slice(&tiebreaker.to_be_bytes()))
    }

    /// Create an ICE-CONTROLLED attribute
    pub fn ice_controlled(tiebreaker: u64) -> Self {
        Self::new(StunAttributeType::IceControlled, Bytes::copy_from_slice(&tiebreaker.to_be_bytes()))
    }

    /// Create an ERROR-CODE attribute
    pub fn error_code(code: u16, reason: &str) -> Self {
        let mut value = BytesMut::with_capacity(4 + reason.len());
        value.put_u16(0);
        value.put_u8((code / 100) as u8);
        value.put_u8((code % 100) as u8);
        value.put_slice(reason.as_bytes());
        Self::new(StunAttributeType::ErrorCode, value.freeze())
    }

    /// Create a LIFETIME attribute (seconds)
    pub fn lifetime(seconds: u32) -> Self {
        Self::new(StunAttributeType::Lifetime, Bytes::copy_from_slice(&seconds.to_be_bytes()))
    }

    /// Create a REQUESTED-TRANSPORT attribute for UDP
    pub fn requested_transport_udp() -> Self {
        Self::new(StunAttributeType::RequestedTransport, Bytes::copy_from_slice(&[PROTOCOL_UDP, 0, 0, 0]))
    }

    /// Create a CHANNEL-NUMBER attribute
    pub fn channel_number(channel: u16) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u16(channel);
        value.put_u16(0);
        Self::new(StunAttributeType::ChannelNumber, value.freeze())
    }

    /// Create a DATA attribute
    pub fn data(data: Bytes) -> Self {
        Self::new(StunAttributeType::Data, data)
    }

    /// Decode an XOR-encoded address attribute
    pub fn as_xor_address(&self, transaction_id: &TransactionId) -> Result<SocketAddr> {
        let (family, port, raw) = self.split_address()?;
        let port = port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        match family {
            1 => {
                let ip = BigEndian::read_u32(raw) ^ STUN_MAGIC_COOKIE;
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
            }
            _ => {
                let key = xor_key(transaction_id);
                let mut octets = [0u8; 16];
                for i in 0..16 {
                    octets[i] = raw[i] ^ key[i];
                }
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
        }
    }

    /// Decode a plain MAPPED-ADDRESS attribute (pre-RFC 5389 servers)
    pub fn as_mapped_address(&self) -> Result<SocketAddr> {
        let (family, port, raw) = self.split_address()?;
        match family {
            1 => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(raw))), port)),
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
        }
    }

    fn split_address(&self) -> Result<(u8, u16, &[u8])> {
        if self.value.len() < 8 {
            return Err(Error::StunError(format!(
                "Address attribute too short: {} bytes",
                self.value.len()
            )));
        }
        let family = self.value[1];
        let port = BigEndian::read_u16(&self.value[2..4]);
        let expected = match family {
            1 => 4,
            2 => 16,
            _ => return Err(Error::StunError(format!("Unsupported address family: {}", family))),
        };
        if self.value.len() < 4 + expected {
            return Err(Error::StunError("Truncated address attribute".to_string()));
        }
        Ok((family, port, &self.value[4..4 + expected]))
    }

    /// Interpret the value as a 32-bit integer (PRIORITY, LIFETIME)
    pub fn as_u32(&self) -> Result<u32> {
        if self.value.len() != 4 {
            return Err(Error::StunError(format!(
                "Expected 4-byte attribute value, got {} bytes",
                self.value.len()
            )));
        }
        Ok(BigEndian::read_u32(&self.value))
    }

    /// Interpret the value as a 64-bit integer (ICE-CONTROLLING, ICE-CONTROLLED)
    pub fn as_u64(&self) -> Result<u64> {
        if self.value.len() != 8 {
            return Err(Error::StunError(format!(
                "Expected 8-byte attribute value, got {} bytes",
                self.value.len()
            )));
        }
        Ok(BigEndian::read_u64(&self.value))
    }

    /// Interpret the value as UTF-8 text (USERNAME, REALM, NONCE, SOFTWARE)
    pub fn as_string(&self) -> Result<String> {
        String::from_utf8(self.value.to_vec())
            .map_err(|e| Error::StunError(format!("Invalid UTF-8 in attribute: {}", e)))
    }

    /// Decode an ERROR-CODE attribute into (code, reason)
    pub fn as_error_code(&self) -> Result<(u16, String)> {
        if self.value.len() < 4 {
            return Err(Error::StunError("ERROR-CODE attribute too short".to_string()));
        }
        let class = (self.value[2] & 0x07) as u16;
        let number = self.value[3] as u16;
        let reason = String::from_utf8_lossy(&self.value[4..]).into_owned();
        Ok((class * 100 + number, reason))
    }

    /// Decode a CHANNEL-NUMBER attribute
    pub fn as_channel_number(&self) -> Result<u16> {
        if self.value.len() != 4 {
            return Err(Error::StunError("CHANNEL-NUMBER attribute must be 4 bytes".to_string()));
        }
        Ok(BigEndian::read_u16(&self.value[0..2]))
    }
}

/// Magic cookie followed by the transaction id, used to XOR IPv6 addresses
fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id.as_bytes());
    key
}
