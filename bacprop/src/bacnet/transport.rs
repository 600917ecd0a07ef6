//! UDP endpoint for BACnet/IP behind a small transport trait, so the engine
//! can be exercised in-memory.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use thiserror::Error;

/// Well-known BACnet/IP port (0xBAC0).
pub const BACNET_IP_PORT: u16 = 47808;

/// Receive timeout; doubles as the engine's command-poll cadence.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("socket setup failed: {0}")]
    Setup(#[from] io::Error),
    #[error("IPv6 bind addresses are not supported")]
    NotIpv4,
}

/// Outbound frame destination class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTo {
    Unicast(SocketAddrV4),
    Broadcast,
}

pub trait Transport: Send {
    fn send(&self, frame: &[u8], to: SendTo) -> io::Result<()>;
    /// Receive one datagram; `Ok(None)` on timeout.
    fn recv(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>>;
}

/// The real socket bound to the configured address and port 47808.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    broadcast: SocketAddrV4,
}

impl UdpTransport {
    pub fn bind(addr: IpAddr, port: u16) -> Result<Self, TransportError> {
        let IpAddr::V4(addr) = addr else {
            return Err(TransportError::NotIpv4);
        };
        let bind_addr = SocketAddr::from((addr, port));
        let socket = UdpSocket::bind(bind_addr).map_err(|source| TransportError::Bind {
            addr: bind_addr,
            source,
        })?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        // Bound to a concrete address: directed subnet broadcast (assumes /24,
        // as the usual BACnet/IP segment). Unspecified: limited broadcast.
        let broadcast_ip = if addr.is_unspecified() {
            Ipv4Addr::BROADCAST
        } else {
            let octets = addr.octets();
            Ipv4Addr::new(octets[0], octets[1], octets[2], 255)
        };
        Ok(Self {
            socket,
            broadcast: SocketAddrV4::new(broadcast_ip, port),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, frame: &[u8], to: SendTo) -> io::Result<()> {
        let destination = match to {
            SendTo::Unicast(addr) => addr,
            SendTo::Broadcast => self.broadcast,
        };
        self.socket.send_to(frame, destination).map(|_| ())
    }

    fn recv(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        match self.socket.recv_from(buffer) {
            Ok((len, SocketAddr::V4(source))) => Ok(Some((len, source))),
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(error)
                if error.kind() == ErrorKind::WouldBlock
                    || error.kind() == ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_and_reports_address() {
        let transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let addr = transport.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[test]
    fn loopback_send_and_receive() {
        let a = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let b = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let SocketAddr::V4(b_addr) = b.local_addr().unwrap() else {
            panic!("expected v4");
        };

        a.send(&[0x81, 0x0A, 0x00, 0x04], SendTo::Unicast(b_addr))
            .unwrap();
        let mut buffer = [0u8; 1500];
        let mut received = None;
        for _ in 0..20 {
            if let Some(got) = b.recv(&mut buffer).unwrap() {
                received = Some(got);
                break;
            }
        }
        let (len, _) = received.expect("datagram should arrive on loopback");
        assert_eq!(&buffer[..len], &[0x81, 0x0A, 0x00, 0x04]);
    }

    #[test]
    fn ipv6_bind_is_refused() {
        let result = UdpTransport::bind("::1".parse().unwrap(), 0);
        assert!(matches!(result, Err(TransportError::NotIpv4)));
    }
}
