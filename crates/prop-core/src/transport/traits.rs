//! Packet transport abstraction.
//!
//! Defines the `PacketTransport` trait used by the host fast-loader,
//! allowing different implementations (TCP, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid host name or IP address: {0}")]
    InvalidAddress(String),

    #[error("Connect to {addr} failed: {message}")]
    ConnectFailed { addr: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract byte-stream transport to the bridge.
pub trait PacketTransport: Send + Sync {
    /// Write all of `data`.
    fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes, waiting at most `timeout`.
    ///
    /// Returns what arrived before the deadline; fails with
    /// [`TransportError::Timeout`] if nothing did.
    fn recv_timeout(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Read at most `max_len` bytes, returning as soon as any arrive.
    ///
    /// Unlike [`recv_timeout`](Self::recv_timeout) this never waits for
    /// more input once something has been read.
    fn recv_some(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.recv_timeout(max_len, timeout)
    }

    /// Close the connection.
    fn close(&self) -> Result<(), TransportError>;
}
