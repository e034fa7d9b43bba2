//! UDP socket wrapper for AMT tunnels
//!
//! Sockets are configured through socket2 and then used as blocking std
//! sockets with a read timeout, so a receive loop can periodically observe
//! shutdown requests.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// Whether this error reports an unreachable destination
    pub fn is_unreachable(&self) -> bool {
        match self {
            SocketError::Io(e) => is_unreachable(e),
            SocketError::InvalidAddress => false,
        }
    }

    /// Whether this error is an expired read timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            SocketError::Io(e) => is_timeout(e),
            SocketError::InvalidAddress => false,
        }
    }

    /// Whether a blocking call was interrupted
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SocketError::Io(e) if e.kind() == ErrorKind::Interrupted)
    }
}

/// Whether an I/O error means the peer (or the path to it) is gone
///
/// A connected UDP socket reports ICMP port/host unreachable on the next
/// send or receive.
pub fn is_unreachable(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::AddrNotAvailable => true,
        // ENETUNREACH / EHOSTUNREACH
        #[cfg(target_os = "linux")]
        _ => matches!(error.raw_os_error(), Some(101) | Some(113)),
        #[cfg(not(target_os = "linux"))]
        _ => false,
    }
}

/// Whether an I/O error is a read timeout expiring
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// UDP socket used for one tunnel
pub struct AmtSocket {
    inner: UdpSocket,
}

impl AmtSocket {
    /// Create a socket bound to the given local address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())?;

        Ok(AmtSocket {
            inner: socket.into(),
        })
    }

    /// Create a socket bound to an ephemeral port on the wildcard address
    /// matching the family of `peer`
    pub fn bind_for(peer: &IpAddr) -> Result<Self, SocketError> {
        let local = match peer {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        Self::bind(local)
    }

    /// Restrict the socket to one peer; later `send`/`recv` calls use it
    pub fn connect(&self, peer: SocketAddr) -> Result<(), SocketError> {
        self.inner.connect(peer)?;
        Ok(())
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.peer_addr()?)
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Set (or clear) the receive timeout
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        // A zero timeout is rejected by the OS; treat it as "poll briefly".
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Send to the connected peer
    pub fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        Ok(self.inner.send(buf)?)
    }

    /// Send data to the given address
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive one datagram from the connected peer
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        Ok(self.inner.recv(buf)?)
    }

    /// Receive one datagram and its source address
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.inner.recv_from(buf)?)
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(AmtSocket {
            inner: self.inner.try_clone()?,
        })
    }

    /// Get a reference to the underlying socket
    pub fn as_udp_socket(&self) -> &UdpSocket {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_creation() {
        let socket = AmtSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_bind_for_matches_family() {
        let socket = AmtSocket::bind_for(&"192.0.2.1".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }

    #[test]
    fn test_socket_send_recv() {
        let sender = AmtSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = AmtSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let receiver_addr = receiver.local_addr().unwrap();
        sender.connect(receiver_addr).unwrap();
        assert_eq!(sender.peer_addr().unwrap(), receiver_addr);

        let data = b"Hello, relay!";
        sender.send(data).unwrap();

        let mut buf = [0u8; 1024];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], data);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_recv_timeout() {
        let socket = AmtSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let mut buf = [0u8; 64];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_unreachable());
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(is_unreachable(&io::Error::from(ErrorKind::ConnectionRefused)));
        assert!(is_unreachable(&io::Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_unreachable(&io::Error::from(ErrorKind::WouldBlock)));
        assert!(!is_unreachable(&io::Error::from(ErrorKind::PermissionDenied)));
        assert!(is_timeout(&io::Error::from(ErrorKind::TimedOut)));
    }

    #[test]
    fn test_socket_ipv6() {
        // May fail on systems without IPv6
        if let Ok(socket) = AmtSocket::bind("[::1]:0".parse().unwrap()) {
            let addr = socket.local_addr().unwrap();
            assert!(addr.is_ipv6());
        }
    }
}
