//! Finding bridges on the local network.
//!
//! Bridges listen for UDP datagrams on a well-known port and answer with a
//! short description of themselves. Our own broadcast may be looped back to
//! us, so it carries a marker that lets us drop it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::transport::TransportError;

pub const DEFAULT_DISCOVER_PORT: u16 = 2000;
pub const DEFAULT_DISCOVER_TIMEOUT_MS: u64 = 2000;

/// Payload of the discovery broadcast.
pub const DISCOVER_REQUEST: &[u8] = b"Me here! Ignore this message.\n";
const ECHO_MARKER: &str = "Me here!";

/// A bridge that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModule {
    pub addr: SocketAddr,
    pub reply: String,
}

/// Broadcast on the default discovery port and collect answers for `timeout`.
pub fn discover(timeout: Duration) -> Result<Vec<DiscoveredModule>, TransportError> {
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_DISCOVER_PORT));
    discover_at(target, timeout)
}

/// Send the discovery request to `target` and collect answers for `timeout`.
#[instrument(level = "info")]
pub fn discover_at(target: SocketAddr, timeout: Duration) -> Result<Vec<DiscoveredModule>, TransportError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    socket
        .send_to(DISCOVER_REQUEST, target)
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let mut modules = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        socket.set_read_timeout(Some(remaining))?;
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                let reply = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                if reply.contains(ECHO_MARKER) {
                    debug!(%addr, "Ignoring our own broadcast");
                    continue;
                }
                info!(%addr, reply = %reply, "Bridge answered");
                modules.push(DiscoveredModule { addr, reply });
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_discover_skips_echo() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = responder.local_addr().unwrap();
        let server = thread::spawn(move || {
            let mut buf = [0u8; 128];
            let (n, from) = responder.recv_from(&mut buf).unwrap();
            responder.send_to(&buf[..n], from).unwrap();
            responder
                .send_to(b"Name: 'wx-1234', IP: 127.0.0.1\n", from)
                .unwrap();
            buf[..n].to_vec()
        });

        let modules = discover_at(target, Duration::from_millis(500)).unwrap();
        assert_eq!(server.join().unwrap(), DISCOVER_REQUEST);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].addr, target);
        assert_eq!(modules[0].reply, "Name: 'wx-1234', IP: 127.0.0.1");
    }

    #[test]
    fn test_discover_nobody_home() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = silent.local_addr().unwrap();
        let modules = discover_at(target, Duration::from_millis(100)).unwrap();
        assert!(modules.is_empty());
    }
}
