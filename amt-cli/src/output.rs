//! Payload output for received channels

use amt_gateway::{DatagramSink, SinkError, SinkId};
use amt_protocol::UdpDatagram;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::stats::OutputStats;

/// Where received payloads are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
    Udp(SocketAddr),
}

impl FromStr for OutputTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-" {
            return Ok(OutputTarget::Stdout);
        }
        if let Some(addr) = s.strip_prefix("udp://") {
            return addr
                .parse()
                .map(OutputTarget::Udp)
                .map_err(|e| format!("Invalid UDP output address '{}': {}", addr, e));
        }
        if s.is_empty() {
            return Err("Empty output target".to_string());
        }
        Ok(OutputTarget::File(PathBuf::from(s)))
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Stdout => write!(f, "stdout"),
            OutputTarget::File(path) => write!(f, "{}", path.display()),
            OutputTarget::Udp(addr) => write!(f, "udp://{}", addr),
        }
    }
}

impl OutputTarget {
    /// Open the target for writing
    pub fn open(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(match self {
            OutputTarget::Stdout => Box::new(io::stdout()),
            OutputTarget::File(path) => Box::new(BufWriter::new(File::create(path)?)),
            OutputTarget::Udp(addr) => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().map_err(invalid)?
                } else {
                    "[::]:0".parse().map_err(invalid)?
                };
                let socket = UdpSocket::bind(bind)?;
                socket.connect(addr)?;
                Box::new(UdpWriter { socket })
            }
        })
    }
}

fn invalid(e: std::net::AddrParseError) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, e)
}

/// Forwards each datagram payload as one write
struct UdpWriter {
    socket: UdpSocket,
}

impl Write for UdpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink writing UDP payloads to a byte stream
pub struct StreamSink {
    id: SinkId,
    writer: Mutex<Box<dyn Write + Send>>,
    datagrams: AtomicU64,
    bytes: AtomicU64,
    closed: AtomicBool,
}

impl StreamSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        StreamSink {
            id: SinkId::next(),
            writer: Mutex::new(writer),
            datagrams: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the output has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> OutputStats {
        OutputStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl DatagramSink for StreamSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn deliver(&self, datagram: &UdpDatagram) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Disconnected);
        }
        let result = self.writer.lock().write_all(&datagram.payload);
        match result {
            Ok(()) => {
                self.datagrams.fetch_add(1, Ordering::Relaxed);
                self.bytes
                    .fetch_add(datagram.payload.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            // UDP forwarding target not listening yet
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                self.closed.store(true, Ordering::Release);
                Err(SinkError::Disconnected)
            }
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                Err(SinkError::Fatal(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn datagram(payload: &'static [u8]) -> UdpDatagram {
        UdpDatagram {
            source: "10.0.0.1".parse().unwrap(),
            source_port: 4000,
            destination: "232.1.1.1".parse().unwrap(),
            destination_port: 5000,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!("-".parse::<OutputTarget>(), Ok(OutputTarget::Stdout));
        assert_eq!(
            "udp://127.0.0.1:5000".parse::<OutputTarget>(),
            Ok(OutputTarget::Udp("127.0.0.1:5000".parse().unwrap()))
        );
        assert_eq!(
            "out.ts".parse::<OutputTarget>(),
            Ok(OutputTarget::File(PathBuf::from("out.ts")))
        );
        assert!("udp://nowhere".parse::<OutputTarget>().is_err());
    }

    #[test]
    fn test_writes_payloads() {
        let buffer = Shared::default();
        let sink = StreamSink::new(Box::new(buffer.clone()));
        sink.deliver(&datagram(b"abc")).unwrap();
        sink.deliver(&datagram(b"de")).unwrap();

        assert_eq!(&*buffer.0.lock(), b"abcde");
        assert_eq!(sink.stats().datagrams, 2);
        assert_eq!(sink.stats().bytes, 5);
    }

    #[test]
    fn test_broken_pipe_disconnects() {
        let sink = StreamSink::new(Box::new(Closed));
        assert_eq!(
            sink.deliver(&datagram(b"abc")),
            Err(SinkError::Disconnected)
        );
        assert!(sink.is_closed());
        assert_eq!(
            sink.deliver(&datagram(b"abc")),
            Err(SinkError::Disconnected)
        );
    }
}
