//! Load states of the bridge-side connection.

use std::fmt;

/// Protocol state of a [`Connection`](super::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// No transfer in progress.
    #[default]
    Idle,
    /// Pulsing the reset line.
    Reset,
    /// Waiting for the target to settle before the handshake.
    TxHandshake,
    /// Handshake sent, waiting for the sentinel byte.
    RxHandshakeStart,
    /// Accumulating the handshake response.
    RxHandshake,
    /// Streaming image segments.
    LoadContinue,
    /// Polling for the checksum result.
    VerifyChecksum,
    /// Capturing the program's first response.
    StartAck,
}

impl LoadState {
    pub fn name(&self) -> &'static str {
        match self {
            LoadState::Idle => "Idle",
            LoadState::Reset => "Reset",
            LoadState::TxHandshake => "TxHandshake",
            LoadState::RxHandshakeStart => "RxHandshakeStart",
            LoadState::RxHandshake => "RxHandshake",
            LoadState::LoadContinue => "LoadContinue",
            LoadState::VerifyChecksum => "VerifyChecksum",
            LoadState::StartAck => "StartAck",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, LoadState::Idle)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
