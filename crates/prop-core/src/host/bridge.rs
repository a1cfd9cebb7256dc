//! Control requests to the bridge's HTTP interface.
//!
//! The fast loader needs three things from the bridge besides the packet
//! channel: a slow ROM-protocol load of the second-stage loader, a baud rate
//! change, and (for the CLI) a bare reset of the target.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::image::PropImage;
use crate::protocol::constants::HTTP_RESPONSE_TIMEOUT_MS;
use crate::transport::{PacketTransport, TcpTransport, TransportError};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Malformed response to {request}: {line:?}")]
    BadResponse { request: String, line: String },
    #[error("{request} returned {status}")]
    Status { request: String, status: u16 },
}

/// Operations the fast loader delegates to the bridge.
pub trait BridgeControl {
    /// Reset the target and load `image` with the ROM protocol.
    fn slow_load(&self, image: &PropImage) -> Result<(), BridgeError>;

    /// Change the bridge's serial baud rate.
    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), BridgeError>;

    /// Pulse the target's reset line.
    fn reset(&self) -> Result<(), BridgeError>;
}

/// Bridge reached over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpBridge {
    host: String,
    port: u16,
    reset_pin: u8,
    initial_baud_rate: u32,
    timeout: Duration,
}

impl HttpBridge {
    pub fn new(host: impl Into<String>, port: u16, reset_pin: u8, initial_baud_rate: u32) -> Self {
        Self {
            host: host.into(),
            port,
            reset_pin,
            initial_baud_rate,
            timeout: Duration::from_millis(HTTP_RESPONSE_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// POST `path` with `body` and return the response status.
    fn post(&self, path: &str, body: &[u8]) -> Result<u16, BridgeError> {
        let transport = TcpTransport::connect(&self.host, self.port)?;

        let mut request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            path, self.host
        )
        .into_bytes();
        if !body.is_empty() {
            request.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        request.extend_from_slice(body);
        debug!(path, body_len = body.len(), "HTTP request");
        transport.send(&request)?;

        let status = read_status(&transport, path, self.timeout);
        transport.close().ok();
        status
    }

    fn post_expect_ok(&self, path: &str, body: &[u8]) -> Result<(), BridgeError> {
        match self.post(path, body)? {
            200 => Ok(()),
            status => Err(BridgeError::Status {
                request: path.to_string(),
                status,
            }),
        }
    }
}

/// Read until the status line is complete and parse its code.
fn read_status<T: PacketTransport>(
    transport: &T,
    request: &str,
    timeout: Duration,
) -> Result<u16, BridgeError> {
    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();

    while !response.windows(2).any(|w| w == b"\r\n") {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.recv_some(1024, remaining) {
            Ok(bytes) => response.extend_from_slice(&bytes),
            Err(TransportError::Closed) if !response.is_empty() => break,
            Err(e) => return Err(e.into()),
        }
    }

    let text = String::from_utf8_lossy(&response);
    let line = text.lines().next().unwrap_or_default();
    debug!(status_line = line, "HTTP response");
    parse_status_line(line).ok_or_else(|| BridgeError::BadResponse {
        request: request.to_string(),
        line: line.to_string(),
    })
}

/// `HTTP/1.1 200 OK` -> 200
pub fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

impl BridgeControl for HttpBridge {
    #[instrument(skip(self, image), fields(size = image.len()))]
    fn slow_load(&self, image: &PropImage) -> Result<(), BridgeError> {
        let path = format!(
            "/propeller/load?reset-pin={}&baud-rate={}",
            self.reset_pin, self.initial_baud_rate
        );
        self.post_expect_ok(&path, image.as_bytes())?;
        info!("Second-stage loader delivered");
        Ok(())
    }

    #[instrument(skip(self))]
    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), BridgeError> {
        let path = format!("/propeller/set-baud-rate?baud-rate={}", baud_rate);
        self.post_expect_ok(&path, &[])
    }

    #[instrument(skip(self))]
    fn reset(&self) -> Result<(), BridgeError> {
        let path = format!("/propeller/reset?reset-pin={}", self.reset_pin);
        self.post_expect_ok(&path, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_line("HTTP/1.0 400 Bad Request"), Some(400));
        assert_eq!(parse_status_line("garbage"), None);
        assert_eq!(parse_status_line(""), None);
    }

    fn serve_once(status: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).unwrap();
            sock.write_all(status.as_bytes()).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (port, handle)
    }

    #[test]
    fn test_set_baud_rate_request() {
        let (port, server) = serve_once("HTTP/1.1 200 OK\r\n\r\n");
        let bridge = HttpBridge::new("127.0.0.1", port, 12, 115_200);
        bridge.set_baud_rate(921_600).unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("POST /propeller/set-baud-rate?baud-rate=921600 HTTP/1.1\r\n"));
    }

    #[test]
    fn test_request_headers() {
        let (port, server) = serve_once("HTTP/1.1 200 OK\r\n\r\n");
        let bridge = HttpBridge::new("127.0.0.1", port, 12, 115_200);
        bridge.reset().unwrap();
        let request = server.join().unwrap();
        assert!(request.contains("\r\nHost: 127.0.0.1\r\n"));
        assert!(request.contains("\r\nConnection: close\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_keep_alive_server_does_not_stall() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            // Hold the connection open like a keep-alive server would.
            thread::sleep(Duration::from_secs(3));
        });

        let bridge = HttpBridge::new("127.0.0.1", port, 12, 115_200);
        let start = Instant::now();
        bridge.set_baud_rate(921_600).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        server.join().unwrap();
    }

    #[test]
    fn test_error_status() {
        let (port, server) = serve_once("HTTP/1.1 400 Bad Request\r\n\r\nNo data\r\n");
        let bridge = HttpBridge::new("127.0.0.1", port, 5, 115_200);
        let err = bridge.reset().unwrap_err();
        assert!(matches!(err, BridgeError::Status { status: 400, .. }));
        let request = server.join().unwrap();
        assert!(request.starts_with("POST /propeller/reset?reset-pin=5 HTTP/1.1\r\n"));
    }
}
