//! UDP sockets behind host candidates
//!
//! Each host candidate owns one socket. A reader task per socket forwards
//! every datagram, tagged with the local address it arrived on, into one
//! bounded channel consumed by the agent task.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::IceConfig;
use crate::error::{Error, Result};
use crate::stream::StreamId;
use crate::transport::Transmit;

/// Datagrams waiting for the agent task
const DATAGRAM_CHANNEL_CAPACITY: usize = 256;

/// Large enough for any UDP payload
const MAX_DATAGRAM_SIZE: usize = 65535;

/// A datagram read from a host socket
#[derive(Debug)]
pub(crate) struct Datagram {
    pub local: SocketAddr,
    pub from: SocketAddr,
    pub data: Bytes,
}

struct BoundSocket {
    stream: StreamId,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Host sockets of every stream, keyed by local address
pub(crate) struct SocketSet {
    sockets: HashMap<SocketAddr, BoundSocket>,
    datagram_tx: mpsc::Sender<Datagram>,
}

impl SocketSet {
    pub fn new() -> (Self, mpsc::Receiver<Datagram>) {
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        (
            Self {
                sockets: HashMap::new(),
                datagram_tx,
            },
            datagram_rx,
        )
    }

    /// Bind a socket on `ip` for a stream, within the port range when one is
    /// configured, and start reading from it
    pub fn bind(&mut self, stream: StreamId, ip: IpAddr, port_range: Option<(u16, u16)>) -> Result<SocketAddr> {
        let std_socket = match port_range {
            None => bind_std(ip, 0)?,
            Some((low, high)) => (low..=high)
                .find_map(|port| bind_std(ip, port).ok())
                .ok_or_else(|| {
                    Error::SocketAllocation(format!("no free port on {} within {}-{}", ip, low, high))
                })?,
        };
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local = socket.local_addr()?;
        info!("Stream {} bound UDP socket {}", stream, local);

        let reader = spawn_reader(local, socket.clone(), self.datagram_tx.clone());
        self.sockets.insert(
            local,
            BoundSocket {
                stream,
                socket,
                reader,
            },
        );
        Ok(local)
    }

    /// Send a datagram without waiting. UDP is best effort: a full socket
    /// buffer drops the datagram.
    ///
    /// Writes go straight to the non-blocking descriptor. Tokio's
    /// `try_send_to` reports WouldBlock until the reactor has polled a newly
    /// registered socket, which would drop the first requests after binding.
    pub fn send(&self, transmit: &Transmit) -> bool {
        let Some(bound) = self.sockets.get(&transmit.source) else {
            warn!("No socket bound to {} for datagram to {}", transmit.source, transmit.destination);
            return false;
        };
        let destination = SockAddr::from(transmit.destination);
        match SockRef::from(&*bound.socket).send_to(&transmit.data, &destination) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("Socket {} busy, datagram to {} dropped", transmit.source, transmit.destination);
                false
            }
            Err(e) => {
                debug!("Send {} -> {} failed: {}", transmit.source, transmit.destination, e);
                false
            }
        }
    }

    /// Apply an IP TOS value to every IPv4 socket of a stream
    pub fn set_tos(&self, stream: StreamId, tos: u32) -> Result<()> {
        for (local, bound) in self.sockets.iter().filter(|(_, b)| b.stream == stream) {
            if local.is_ipv4() {
                SockRef::from(&*bound.socket).set_tos(tos)?;
            } else {
                debug!("TOS not applied to IPv6 socket {}", local);
            }
        }
        Ok(())
    }

    /// Local addresses bound for a stream
    pub fn addresses(&self, stream: StreamId) -> Vec<SocketAddr> {
        let mut addresses: Vec<SocketAddr> = self
            .sockets
            .iter()
            .filter(|(_, b)| b.stream == stream)
            .map(|(addr, _)| *addr)
            .collect();
        addresses.sort();
        addresses
    }

    /// Close every socket of a stream
    pub fn close_stream(&mut self, stream: StreamId) {
        let addresses = self.addresses(stream);
        for address in addresses {
            if let Some(bound) = self.sockets.remove(&address) {
                bound.reader.abort();
                debug!("Closed UDP socket {}", address);
            }
        }
    }

    /// Close every socket
    pub fn close(&mut self) {
        for (_, bound) in self.sockets.drain() {
            bound.reader.abort();
        }
    }
}

impl Drop for SocketSet {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_std(ip: IpAddr, port: u16) -> io::Result<std::net::UdpSocket> {
    let domain = if ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if ip.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(ip, port).into())?;
    Ok(socket.into())
}

fn spawn_reader(local: SocketAddr, socket: Arc<UdpSocket>, tx: mpsc::Sender<Datagram>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let datagram = Datagram {
                        local,
                        from,
                        data: Bytes::copy_from_slice(&buf[..len]),
                    };
                    if tx.send(datagram).await.is_err() {
                        break;
                    }
                }
                // ICMP port unreachable surfaces as a reset on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    trace!("Ignoring reset on {}", local);
                }
                Err(e) => {
                    error!("Error receiving on {}: {}", local, e);
                    break;
                }
            }
        }
        debug!("UDP reader for {} terminated", local);
    })
}

fn is_link_local_v6(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80)
}

/// Local addresses to gather host candidates on: the configured list, or
/// the host's interfaces filtered by the configuration. Falls back to the
/// IPv4 loopback address when nothing usable is found.
pub(crate) fn host_addresses(config: &IceConfig) -> Vec<IpAddr> {
    if !config.host_addresses.is_empty() {
        return config.host_addresses.clone();
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    };

    let mut addresses: Vec<IpAddr> = interfaces
        .into_iter()
        .map(|(_, ip)| ip)
        .filter(|ip| !ip.is_unspecified() && !ip.is_multicast())
        .filter(|ip| config.include_loopback || !ip.is_loopback())
        .filter(|ip| config.enable_ipv6 || ip.is_ipv4())
        .filter(|ip| !is_link_local_v6(ip))
        .collect();
    addresses.sort();
    addresses.dedup();

    if addresses.is_empty() {
        warn!("No usable interface address, gathering on loopback");
        addresses.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_host_addresses_win() {
        let config = IceConfig {
            host_addresses: vec!["192.0.2.1".parse().unwrap()],
            ..IceConfig::default()
        };
        assert_eq!(host_addresses(&config), vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_enumerated_addresses_respect_filters() {
        let config = IceConfig::default();
        let addresses = host_addresses(&config);
        assert!(!addresses.is_empty());
        // Loopback is only used as the fallback
        if addresses.len() > 1 {
            assert!(addresses.iter().all(|ip| !ip.is_loopback()));
        }
        assert!(addresses.iter().all(|ip| ip.is_ipv4()));
    }

    #[test]
    fn test_link_local_detection() {
        assert!(is_link_local_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_link_local_v6(&"2001:db8::1".parse().unwrap()));
        assert!(!is_link_local_v6(&"10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_bind_send_and_receive() {
        let (mut sockets, mut datagrams) = SocketSet::new();
        let a = sockets.bind(1, IpAddr::V4(Ipv4Addr::LOCALHOST), None).unwrap();
        let b = sockets.bind(1, IpAddr::V4(Ipv4Addr::LOCALHOST), None).unwrap();
        assert_eq!(sockets.addresses(1).len(), 2);

        assert!(sockets.send(&Transmit {
            source: a,
            destination: b,
            data: Bytes::from_static(b"ping"),
        }));
        let datagram = datagrams.recv().await.unwrap();
        assert_eq!(datagram.local, b);
        assert_eq!(datagram.from, a);
        assert_eq!(&datagram.data[..], b"ping");

        sockets.set_tos(1, 0xb8).unwrap();
        sockets.close_stream(1);
        assert!(sockets.addresses(1).is_empty());
    }

    #[tokio::test]
    async fn test_send_in_same_turn_as_bind_is_not_dropped() {
        let (mut sockets, mut datagrams) = SocketSet::new();
        let a = sockets.bind(7, IpAddr::V4(Ipv4Addr::LOCALHOST), None).unwrap();
        let b = sockets.bind(7, IpAddr::V4(Ipv4Addr::LOCALHOST), None).unwrap();

        // No await between binding and sending, as in the agent's gather turn
        for (source, destination) in [(a, b), (b, a)] {
            assert!(sockets.send(&Transmit {
                source,
                destination,
                data: Bytes::from_static(b"first"),
            }));
        }

        let mut received = Vec::new();
        for _ in 0..2 {
            let datagram = tokio::time::timeout(std::time::Duration::from_secs(2), datagrams.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&datagram.data[..], b"first");
            received.push((datagram.from, datagram.local));
        }
        received.sort();
        let mut expected = vec![(a, b), (b, a)];
        expected.sort();
        assert_eq!(received, expected);
    }
}
