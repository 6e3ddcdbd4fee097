//! Datagram types shared by the protocol core and the socket layer

use std::net::SocketAddr;

use bytes::Bytes;

use crate::stun::is_stun;

/// A datagram the protocol core wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Local base address to send from
    pub source: SocketAddr,
    /// Destination address
    pub destination: SocketAddr,
    /// Payload
    pub data: Bytes,
}

/// What an incoming datagram carries, by its first byte (RFC 7983)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// STUN message (first byte 0..=3 with the magic cookie)
    Stun,
    /// TURN ChannelData (first byte 64..=79)
    ChannelData,
    /// Anything else belongs to the application
    Application,
}

/// Classify an incoming datagram
pub fn classify(data: &[u8]) -> PacketKind {
    match data.first() {
        Some(0..=3) if is_stun(data) => PacketKind::Stun,
        Some(64..=79) if data.len() >= 4 => PacketKind::ChannelData,
        _ => PacketKind::Application,
    }
}
