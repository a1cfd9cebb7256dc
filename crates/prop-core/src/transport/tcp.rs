//! TCP transport to the bridge's serial port.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use super::traits::{PacketTransport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Resolve `host` and connect to `port`.
    #[instrument(level = "info")]
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
            TransportError::ConnectFailed {
                addr: addr.to_string(),
                message: e.to_string(),
            }
        })?;
        stream.set_nodelay(true)?;
        info!(peer = %addr, "Connected");
        Ok(Self { stream })
    }
}

/// Resolve a host name or dotted IP address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::InvalidAddress(host.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TransportError::InvalidAddress(host.to_string()))
}

impl PacketTransport for TcpTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        (&self.stream)
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn recv_timeout(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; max_len];
        let mut received = 0;

        while received < max_len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.stream.set_read_timeout(Some(deadline - now))?;
            match (&self.stream).read(&mut buf[received..]) {
                Ok(0) => {
                    if received == 0 {
                        return Err(TransportError::Closed);
                    }
                    break;
                }
                Ok(n) => received += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
            }
        }

        if received == 0 {
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        buf.truncate(received);
        debug!(bytes_read = received, "Read complete");
        Ok(buf)
    }

    fn recv_some(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len];
        self.stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
            }
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
