//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow a fast load without
//! tight coupling to the protocol code.

use std::fmt;

/// Fast-load phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// Reading the program and building the loader.
    Preparing,
    /// Sending the second-stage loader with the ROM protocol.
    SlowLoad,
    /// Waiting for the second-stage loader's greeting.
    WaitingForLoader,
    /// Streaming program packets.
    Streaming,
    /// RAM checksum verification.
    VerifyRam,
    /// EEPROM program and verify.
    ProgramEeprom,
    /// Ready-to-launch / launch-now.
    Launch,
    /// Load finished.
    Complete,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadPhase::Preparing => write!(f, "Preparing"),
            LoadPhase::SlowLoad => write!(f, "Slow Load"),
            LoadPhase::WaitingForLoader => write!(f, "Waiting for Loader"),
            LoadPhase::Streaming => write!(f, "Streaming"),
            LoadPhase::VerifyRam => write!(f, "Verify RAM"),
            LoadPhase::ProgramEeprom => write!(f, "Program EEPROM"),
            LoadPhase::Launch => write!(f, "Launch"),
            LoadPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted by the fast loader.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// Phase changed.
    PhaseChanged { from: LoadPhase, to: LoadPhase },
    /// Bytes of the program acknowledged so far.
    Progress { current: u64, total: u64 },
    /// Packet sent or ack received.
    Packet {
        direction: PacketDirection,
        id: i32,
        length: usize,
    },
    /// A packet attempt went unanswered and will be resent.
    Retry { id: i32, attempt: usize },
    /// Error occurred.
    Error { message: String },
    /// Program launched.
    Complete,
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Bridge
    Rx, // Bridge -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving load events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait LoadObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &LoadEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LoadObserver for NullObserver {
    fn on_event(&self, _event: &LoadEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LoadObserver for TracingObserver {
    fn on_event(&self, event: &LoadEvent) {
        match event {
            LoadEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            LoadEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(progress = %format!("{}%", pct), current, total, "Progress");
            }
            LoadEvent::Packet {
                direction,
                id,
                length,
            } => {
                tracing::trace!(dir = %direction, id, len = length, "Packet");
            }
            LoadEvent::Retry { id, attempt } => {
                tracing::warn!(id, attempt, "No valid ack, retrying packet");
            }
            LoadEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            LoadEvent::Complete => {
                tracing::info!("Program launched");
            }
        }
    }
}

/// Observer that records every event, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<LoadEvent>>,
}

#[cfg(test)]
impl LoadObserver for RecordingObserver {
    fn on_event(&self, event: &LoadEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
