//! Protocol constants for the Propeller fast loader and boot ROM.

// ============================================================================
// Host fast-loader packet protocol
// ============================================================================

/// Size of the second-stage loader's packet buffer.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Packet header: id (i32 LE) + tag (i32 LE).
pub const PACKET_HEADER_SIZE: usize = 8;

/// Ack: result (i32 LE) + echoed tag (i32 LE).
pub const ACK_SIZE: usize = 8;

/// Send attempts per packet, each with a fresh tag.
pub const PACKET_ATTEMPTS: usize = 3;

/// Default ack wait in milliseconds.
pub const PACKET_TIMEOUT_MS: u64 = 2000;

/// Ack wait while the loader programs and verifies the EEPROM.
pub const EEPROM_PACKET_TIMEOUT_MS: u64 = 8000;

/// Wait for the second-stage loader's greeting.
pub const LOADER_START_TIMEOUT_MS: u64 = 2000;

/// Seconds the second-stage loader waits for a packet before giving up.
pub const FAILSAFE_TIMEOUT_SECS: f64 = 2.0;

/// Cycles by which the loader's start-bit detection may be late.
pub const MAX_RX_SENSE_ERROR: f64 = 23.0;

/// Distance of the host-initialised block from the end of the loader template.
pub const LOADER_INIT_OFFSET_FROM_END: usize = 10 * 4 + 8;

/// Added to the program checksum by the loader's launch sequence.
pub const INIT_CALL_FRAME: [u8; 8] = [0xFF, 0xFF, 0xF9, 0xFF, 0xFF, 0xFF, 0xF9, 0xFF];

/// Target clock assumed when patching the loader.
pub const DEFAULT_CLOCK_SPEED: u32 = 80_000_000;

// ============================================================================
// Bridge endpoints
// ============================================================================

pub const DEFAULT_TELNET_PORT: u16 = 23;
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const HTTP_RESPONSE_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_INITIAL_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_FINAL_BAUD_RATE: u32 = 921_600;
pub const DEFAULT_RESET_PIN: u8 = 12;
pub const DEFAULT_TERMINAL_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Bridge load state machine timing (milliseconds)
// ============================================================================

pub const RESET_DELAY_1: u32 = 10;
pub const RESET_DELAY_2: u32 = 10;
pub const RESET_DELAY_3: u32 = 100;

pub const LOAD_SEGMENT_MAX_SIZE: usize = 1024;
pub const LOAD_SEGMENT_DELAY: u32 = 50;

pub const RX_HANDSHAKE_TIMEOUT: u32 = 2000;
pub const RX_CHECKSUM_TIMEOUT: u32 = 250;
pub const CHECKSUM_POLL_INTERVAL: u32 = 10;
pub const EEPROM_PROGRAM_TIMEOUT: u32 = 5000;
pub const EEPROM_VERIFY_TIMEOUT: u32 = 2000;

pub const DEFAULT_RESPONSE_TIMEOUT: u32 = 2000;

/// Largest post-load response the bridge will capture.
pub const MAX_RESPONSE_SIZE: usize = 1024;

// ============================================================================
// P8X32A boot ROM
// ============================================================================

/// LFSR seed ('P').
pub const LFSR_SEED: u8 = b'P';

/// Host-to-target handshake bits.
pub const TX_HANDSHAKE_BITS: usize = 250;

/// Target-to-host handshake bits (excluding the version).
pub const RX_HANDSHAKE_BITS: usize = 250;

/// Response bytes carrying the handshake bits, two per byte.
pub const RX_HANDSHAKE_SIZE: usize = RX_HANDSHAKE_BITS / 2;

/// Response bytes carrying the 8-bit chip version.
pub const RX_VERSION_SIZE: usize = 4;

/// Full handshake response held by the bridge.
pub const RX_RESPONSE_SIZE: usize = RX_HANDSHAKE_SIZE + RX_VERSION_SIZE;

/// Calibration pulse pair, also used to clock target replies.
pub const CALIBRATION_BYTE: u8 = 0xF9;

/// Poll byte sent while waiting for the checksum verdict.
pub const CHECKSUM_POLL_BYTE: u8 = 0xF9;

/// Target reply meaning the RAM checksum matched.
pub const CHECKSUM_OK: u8 = 0xFE;

/// Base pattern of a target reply byte; bits 0 and 5 carry data.
pub const RX_BYTE_BASE: u8 = 0xCE;

/// Propeller chip version reported by the P8X32A.
pub const P8X32A_VERSION: u8 = 1;
