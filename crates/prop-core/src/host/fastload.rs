//! Host fast loader.
//!
//! A program is loaded in two stages. First a small second-stage loader is
//! sent with the slow ROM protocol (delegated to the bridge). Once running it
//! greets the host and accepts the program as acknowledged packets:
//!
//! ```text
//! host                                   loader
//!  | <------------- greeting (count, _) ---|
//!  | -- data (id=N) ---------------------> |
//!  | <------------------- ack (N-1, tag) --|
//!  |    ... down to id=1 ...               |
//!  | -- verify RAM (id=0) ---------------> |
//!  | <-------------- ack (-checksum, tag) -|
//!  | -- program EEPROM (id=-checksum) ---> |   (optional)
//!  | <------------ ack (-checksum*2, tag) -|
//!  | -- ready to launch (id) ------------> |
//!  | <------------------- ack (id-1, tag) -|
//!  | -- launch now (id-1) ---------------> |
//! ```
//!
//! The checksum travels in the ack's result field and the ids derived from it
//! are what the loader firmware expects; the arithmetic is wrapping `i32`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::bridge::{BridgeControl, BridgeError, HttpBridge};
use super::tags::{RandomTags, TagSource};
use crate::events::{LoadEvent, LoadObserver, LoadPhase, PacketDirection};
use crate::protocol::constants::*;
use crate::protocol::{
    Ack, BitTimings, LoadType, LoaderBundle, LoaderError, PacketHeader, generate_loader_image,
};
use crate::transport::{PacketTransport, TcpTransport, TransportError};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Image too large: {0} bytes")]
    ImageTooLarge(usize),
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("Second-stage loader failed to start: {0}")]
    LoaderStart(String),
    #[error("Unexpected result for packet {id}: expected {expected}, received {actual}")]
    UnexpectedResult { id: i32, expected: i32, actual: i32 },
    #[error("Bad checksum: expected {expected}, received {actual}")]
    BadChecksum { expected: i32, actual: i32 },
    #[error("No valid ack for packet {id} after {attempts} attempts")]
    Timeout { id: i32, attempts: usize },
}

/// Link parameters for one fast load.
#[derive(Debug, Clone)]
pub struct FastLoadOptions {
    pub clock_speed: u32,
    pub initial_baud_rate: u32,
    pub final_baud_rate: u32,
    pub reset_pin: u8,
    pub telnet_port: u16,
    pub http_port: u16,
}

impl Default for FastLoadOptions {
    fn default() -> Self {
        Self {
            clock_speed: DEFAULT_CLOCK_SPEED,
            initial_baud_rate: DEFAULT_INITIAL_BAUD_RATE,
            final_baud_rate: DEFAULT_FINAL_BAUD_RATE,
            reset_pin: DEFAULT_RESET_PIN,
            telnet_port: DEFAULT_TELNET_PORT,
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

/// Number of data packets needed for `size` bytes.
pub fn packet_count(size: usize) -> Result<i32, LoadError> {
    i32::try_from(size.div_ceil(MAX_PACKET_SIZE)).map_err(|_| LoadError::ImageTooLarge(size))
}

/// Checksum the loader reports after the verify-RAM packet, before negation.
pub fn program_checksum(program: &[u8]) -> i32 {
    program
        .iter()
        .chain(INIT_CALL_FRAME.iter())
        .fold(0i32, |acc, &b| acc.wrapping_add(i32::from(b)))
}

/// Drives one fast load over an open packet channel.
pub struct FastLoader<'a, T: PacketTransport, B: BridgeControl, O: LoadObserver> {
    transport: &'a T,
    bridge: &'a B,
    observer: &'a O,
    bundle: &'a LoaderBundle,
    options: FastLoadOptions,
    tags: Box<dyn TagSource + 'a>,
    phase: LoadPhase,
}

impl<'a, T: PacketTransport, B: BridgeControl, O: LoadObserver> FastLoader<'a, T, B, O> {
    pub fn new(
        transport: &'a T,
        bridge: &'a B,
        observer: &'a O,
        bundle: &'a LoaderBundle,
        options: FastLoadOptions,
    ) -> Self {
        Self {
            transport,
            bridge,
            observer,
            bundle,
            options,
            tags: Box::new(RandomTags::new()),
            phase: LoadPhase::Preparing,
        }
    }

    /// Replace the tag source.
    pub fn with_tags(mut self, tags: impl TagSource + 'a) -> Self {
        self.tags = Box::new(tags);
        self
    }

    fn emit(&self, event: LoadEvent) {
        self.observer.on_event(&event);
    }

    fn enter(&mut self, phase: LoadPhase) {
        self.emit(LoadEvent::PhaseChanged {
            from: self.phase,
            to: phase,
        });
        self.phase = phase;
    }

    /// Load `program` and start it.
    #[instrument(skip(self, program, load_type), fields(size = program.len(), load_type = %load_type))]
    pub fn load(&mut self, program: &[u8], load_type: LoadType) -> Result<(), LoadError> {
        let result = self.run(program, load_type);
        if let Err(e) = &result {
            self.emit(LoadEvent::Error {
                message: e.to_string(),
            });
        }
        result
    }

    fn run(&mut self, program: &[u8], load_type: LoadType) -> Result<(), LoadError> {
        let mut packet_id = packet_count(program.len())?;

        let timings = BitTimings::new(
            self.options.clock_speed,
            self.options.initial_baud_rate,
            self.options.final_baud_rate,
        )?;
        let loader = generate_loader_image(&self.bundle.image, &timings, packet_id)?;
        let checksum = program_checksum(program);
        debug!(packet_count = packet_id, checksum, "Prepared load");

        self.enter(LoadPhase::SlowLoad);
        self.bridge.slow_load(&loader)?;

        self.enter(LoadPhase::WaitingForLoader);
        self.wait_for_loader(packet_id)?;

        self.bridge.set_baud_rate(self.options.final_baud_rate)?;

        self.enter(LoadPhase::Streaming);
        let timeout = Duration::from_millis(PACKET_TIMEOUT_MS);
        let total = program.len() as u64;
        let mut sent = 0u64;
        for chunk in program.chunks(MAX_PACKET_SIZE) {
            let result = self.exchange(packet_id, chunk, timeout)?;
            self.expect(packet_id, packet_id.wrapping_sub(1), result)?;
            packet_id = packet_id.wrapping_sub(1);
            sent += chunk.len() as u64;
            self.emit(LoadEvent::Progress {
                current: sent,
                total,
            });
        }

        self.enter(LoadPhase::VerifyRam);
        let bundle = self.bundle;
        let result = self.exchange(packet_id, &bundle.verify_ram, timeout)?;
        let expected = checksum.wrapping_neg();
        if result != expected {
            return Err(LoadError::BadChecksum {
                expected,
                actual: result,
            });
        }
        packet_id = expected;

        if load_type.programs() {
            self.enter(LoadPhase::ProgramEeprom);
            let result = self.exchange(
                packet_id,
                &bundle.program_verify_eeprom,
                Duration::from_millis(EEPROM_PACKET_TIMEOUT_MS),
            )?;
            let expected = checksum.wrapping_neg().wrapping_mul(2);
            if result != expected {
                return Err(LoadError::BadChecksum {
                    expected,
                    actual: result,
                });
            }
            packet_id = expected;
        }

        self.enter(LoadPhase::Launch);
        let result = self.exchange(packet_id, &bundle.ready_to_launch, timeout)?;
        self.expect(packet_id, packet_id.wrapping_sub(1), result)?;
        packet_id = packet_id.wrapping_sub(1);

        self.transmit_packet(packet_id, &bundle.launch_now, None)?;

        self.transport.close()?;
        self.enter(LoadPhase::Complete);
        self.emit(LoadEvent::Complete);
        info!(bytes = program.len(), "Load complete");
        Ok(())
    }

    /// Wait for the second-stage loader to report the packet count.
    fn wait_for_loader(&self, packet_id: i32) -> Result<(), LoadError> {
        let greeting = self
            .transport
            .recv_timeout(ACK_SIZE, Duration::from_millis(LOADER_START_TIMEOUT_MS))
            .map_err(|e| LoadError::LoaderStart(e.to_string()))?;
        let ack = Ack::from_bytes(&greeting).map_err(|e| LoadError::LoaderStart(e.to_string()))?;
        if ack.result != packet_id {
            return Err(LoadError::LoaderStart(format!(
                "packet id {}, result {}",
                packet_id, ack.result
            )));
        }
        info!(packet_count = packet_id, "Second-stage loader started");
        Ok(())
    }

    fn expect(&self, id: i32, expected: i32, actual: i32) -> Result<(), LoadError> {
        if actual != expected {
            return Err(LoadError::UnexpectedResult {
                id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Send a packet that must be answered with a result.
    fn exchange(&mut self, id: i32, payload: &[u8], timeout: Duration) -> Result<i32, LoadError> {
        self.transmit_packet(id, payload, Some(timeout))?
            .ok_or(LoadError::Timeout {
                id,
                attempts: PACKET_ATTEMPTS,
            })
    }

    /// Send a packet and, when `timeout` is given, wait for its ack.
    ///
    /// Each attempt uses a fresh tag. An ack counts only if it is exactly
    /// 8 bytes, echoes the tag just sent, and carries a result other than
    /// `id` (an unchanged id is a stale reply). Without a timeout the packet
    /// is sent once and no reply is read.
    pub fn transmit_packet(
        &mut self,
        id: i32,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<i32>, LoadError> {
        for attempt in 1..=PACKET_ATTEMPTS {
            let tag = self.tags.next_tag();
            let packet = PacketHeader::new(id, tag).encode(payload);
            self.transport.send(&packet)?;
            self.emit(LoadEvent::Packet {
                direction: PacketDirection::Tx,
                id,
                length: packet.len(),
            });

            let Some(timeout) = timeout else {
                return Ok(None);
            };

            match self.transport.recv_timeout(ACK_SIZE, timeout) {
                Ok(bytes) => match Ack::from_bytes(&bytes) {
                    Ok(ack) if ack.tag == tag && ack.result != id => {
                        self.emit(LoadEvent::Packet {
                            direction: PacketDirection::Rx,
                            id: ack.result,
                            length: bytes.len(),
                        });
                        return Ok(Some(ack.result));
                    }
                    Ok(ack) => {
                        debug!(id, tag, ack_tag = ack.tag, result = ack.result, "Ignoring stale ack");
                    }
                    Err(e) => debug!(id, error = %e, "Ignoring malformed ack"),
                },
                Err(TransportError::Timeout { .. }) => debug!(id, attempt, "Ack timeout"),
                Err(e) => return Err(e.into()),
            }

            if attempt < PACKET_ATTEMPTS {
                self.emit(LoadEvent::Retry { id, attempt });
            }
        }

        warn!(id, "Packet retries exhausted");
        Err(LoadError::Timeout {
            id,
            attempts: PACKET_ATTEMPTS,
        })
    }
}

/// Read `path` and fast-load it onto the target behind `host`.
#[instrument(skip(path, load_type, bundle, options, observer), fields(file = %path.as_ref().display()))]
pub fn fast_load<O: LoadObserver>(
    host: &str,
    path: impl AsRef<Path>,
    load_type: LoadType,
    bundle: &LoaderBundle,
    options: &FastLoadOptions,
    observer: &O,
) -> Result<(), LoadError> {
    let path = path.as_ref();
    let program = std::fs::read(path).map_err(|source| LoadError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    info!(size = program.len(), "Loaded program file");

    let transport = TcpTransport::connect(host, options.telnet_port)?;
    let bridge = HttpBridge::new(
        host,
        options.http_port,
        options.reset_pin,
        options.initial_baud_rate,
    );

    let mut loader = FastLoader::new(&transport, &bridge, observer, bundle, options.clone());
    let result = loader.load(&program, load_type);
    result
}
