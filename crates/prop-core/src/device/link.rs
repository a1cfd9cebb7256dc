//! Byte-level link to the target's boot ROM.
//!
//! The P8X32A ROM listens for a host-driven handshake right after reset. The
//! host drives pulses on the serial line: a short low pulse is a 1, a long
//! (two bit times) low pulse is a 0. Two pulses fit in one UART byte:
//!
//! | bits  | byte |
//! |-------|------|
//! | 1, 1  | 0xFD |
//! | 1, 0  | 0xF9 |
//! | 0, 1  | 0xFA |
//! | 0, 0  | 0xF2 |
//!
//! The handshake is a calibration byte, 250 bits from an 8-bit LFSR seeded
//! with `'P'`, then clock bytes the target answers on. Each answer byte is
//! `0xCE | b0 | b1 << 5`: 125 bytes continuing the LFSR sequence and 4 bytes
//! carrying the chip version. The image follows as longs (command, long
//! count, then the image), each sent LSB first as 16 encoded bytes.

use thiserror::Error;
use tracing::debug;

use super::source::ImageStream;
use crate::protocol::LoadType;
use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Handshake response mismatch at byte {offset}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    HandshakeMismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },
    #[error("Handshake response too short: {actual} bytes, expected {expected}")]
    ResponseTooShort { expected: usize, actual: usize },
    #[error("Image read failed: {0}")]
    Read(#[from] std::io::Error),
}

/// Operations the bridge state machine needs from the target link.
///
/// Bytes to transmit are appended to `out`; the caller owns the UART.
pub trait TargetLink {
    /// Emit the synchronisation sequence.
    fn initiate_handshake(&mut self, out: &mut Vec<u8>);

    /// Number of response bytes that complete the handshake.
    fn response_len(&self) -> usize;

    /// First byte of a valid handshake response. Anything received before it
    /// is line noise from the reset.
    fn response_sentinel(&self) -> u8;

    /// Check an accumulated response, returning the chip version.
    fn verify_handshake_response(&self, response: &[u8]) -> Result<u8, LinkError>;

    /// Begin streaming the image. Returns `true` if everything was emitted.
    fn load_image(
        &mut self,
        stream: &mut ImageStream,
        load_type: LoadType,
        out: &mut Vec<u8>,
    ) -> Result<bool, LinkError>;

    /// Emit the next segment. Returns `true` once the image is complete.
    fn load_image_continue(
        &mut self,
        stream: &mut ImageStream,
        load_type: LoadType,
        out: &mut Vec<u8>,
    ) -> Result<bool, LinkError>;
}

/// Two pulses per UART byte, indexed by `(first << 1) | second`.
const PULSE_PAIRS: [u8; 4] = [0xF2, 0xFA, 0xF9, 0xFD];

/// Encoded bytes per 32-bit long.
const BYTES_PER_LONG: usize = 16;

/// Boot ROM link for the P8X32A.
pub struct PropellerLink {
    tx_handshake: Vec<u8>,
    rx_handshake: Vec<u8>,
}

impl PropellerLink {
    pub fn new() -> Self {
        let mut bits = Lfsr::new(LFSR_SEED);
        let tx_bits: Vec<bool> = (0..TX_HANDSHAKE_BITS).map(|_| bits.next_bit()).collect();
        let rx_bits: Vec<bool> = (0..RX_HANDSHAKE_BITS).map(|_| bits.next_bit()).collect();

        let mut tx_handshake = Vec::with_capacity(1 + TX_HANDSHAKE_BITS / 2 + RX_RESPONSE_SIZE);
        tx_handshake.push(CALIBRATION_BYTE);
        encode_bits(&tx_bits, &mut tx_handshake);
        tx_handshake.extend(std::iter::repeat_n(CALIBRATION_BYTE, RX_RESPONSE_SIZE));

        let rx_handshake = rx_bits
            .chunks(2)
            .map(|pair| rx_byte(pair[0], pair[1]))
            .collect();

        Self {
            tx_handshake,
            rx_handshake,
        }
    }

    /// The response a healthy target of `version` sends.
    pub fn expected_response(&self, version: u8) -> Vec<u8> {
        let mut response = self.rx_handshake.clone();
        for i in 0..RX_VERSION_SIZE {
            let b0 = (version >> (2 * i)) & 1 == 1;
            let b1 = (version >> (2 * i + 1)) & 1 == 1;
            response.push(rx_byte(b0, b1));
        }
        response
    }

    /// Append whole longs until the segment begun at `start` is full.
    fn fill_segment(
        &self,
        stream: &mut ImageStream,
        out: &mut Vec<u8>,
        start: usize,
    ) -> Result<bool, LinkError> {
        while stream.remaining() > 0 && out.len() - start + BYTES_PER_LONG <= LOAD_SEGMENT_MAX_SIZE {
            let mut long = [0u8; 4];
            stream.read_next(&mut long)?;
            encode_long(u32::from_le_bytes(long), out);
        }
        debug!(encoded = out.len() - start, remaining = stream.remaining(), "Encoded segment");
        Ok(stream.remaining() == 0)
    }
}

impl Default for PropellerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetLink for PropellerLink {
    fn initiate_handshake(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tx_handshake);
    }

    fn response_len(&self) -> usize {
        RX_RESPONSE_SIZE
    }

    fn response_sentinel(&self) -> u8 {
        self.rx_handshake[0]
    }

    fn verify_handshake_response(&self, response: &[u8]) -> Result<u8, LinkError> {
        if response.len() < RX_RESPONSE_SIZE {
            return Err(LinkError::ResponseTooShort {
                expected: RX_RESPONSE_SIZE,
                actual: response.len(),
            });
        }
        for (offset, (&expected, &actual)) in self.rx_handshake.iter().zip(response).enumerate() {
            if expected != actual {
                return Err(LinkError::HandshakeMismatch {
                    offset,
                    expected,
                    actual,
                });
            }
        }

        let mut version = 0u8;
        for (i, &b) in response[RX_HANDSHAKE_SIZE..RX_RESPONSE_SIZE].iter().enumerate() {
            if b & !0x21 != RX_BYTE_BASE {
                return Err(LinkError::HandshakeMismatch {
                    offset: RX_HANDSHAKE_SIZE + i,
                    expected: RX_BYTE_BASE,
                    actual: b,
                });
            }
            version = ((version >> 2) & 0x3F) | ((b & 0x01) << 6) | ((b & 0x20) << 2);
        }
        Ok(version)
    }

    fn load_image(
        &mut self,
        stream: &mut ImageStream,
        load_type: LoadType,
        out: &mut Vec<u8>,
    ) -> Result<bool, LinkError> {
        let start = out.len();
        let long_count = stream.remaining().div_ceil(4) as u32;
        encode_long(u32::from(load_type.bits()), out);
        encode_long(long_count, out);
        debug!(long_count, load_type = %load_type, "Starting image download");
        self.fill_segment(stream, out, start)
    }

    fn load_image_continue(
        &mut self,
        stream: &mut ImageStream,
        _load_type: LoadType,
        out: &mut Vec<u8>,
    ) -> Result<bool, LinkError> {
        let start = out.len();
        self.fill_segment(stream, out, start)
    }
}

/// Propeller boot LFSR.
struct Lfsr(u8);

impl Lfsr {
    fn new(seed: u8) -> Self {
        Self(seed)
    }

    fn next_bit(&mut self) -> bool {
        let v = self.0;
        let bit = v & 1 == 1;
        self.0 = (v << 1) | (((v >> 7) ^ (v >> 5) ^ (v >> 4) ^ (v >> 1)) & 1);
        bit
    }
}

fn encode_bits(bits: &[bool], out: &mut Vec<u8>) {
    for pair in bits.chunks(2) {
        let first = pair[0] as usize;
        let second = pair.get(1).copied().unwrap_or(false) as usize;
        out.push(PULSE_PAIRS[(first << 1) | second]);
    }
}

fn encode_long(value: u32, out: &mut Vec<u8>) {
    let bits: Vec<bool> = (0..32).map(|i| (value >> i) & 1 == 1).collect();
    encode_bits(&bits, out);
}

fn rx_byte(b0: bool, b1: bool) -> u8 {
    RX_BYTE_BASE | u8::from(b0) | (u8::from(b1) << 5)
}
