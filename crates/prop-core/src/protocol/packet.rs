//! Fast-loader packet and ack framing.
//!
//! ```text
//! packet: | id (i32 LE) | tag (i32 LE) | payload (<= 1024) |
//! ack:    | result (i32 LE) | tag (i32 LE) |
//! ```

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{ACK_SIZE, PACKET_HEADER_SIZE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Ack must be exactly {expected} bytes, got {actual}")]
    BadAckLength { expected: usize, actual: usize },
}

/// Packet header (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packets remaining including this one, or a checksum-derived id for
    /// control packets.
    pub id: i32,
    /// Random correlation tag echoed by the ack.
    pub tag: i32,
}

impl PacketHeader {
    pub const SIZE: usize = PACKET_HEADER_SIZE;

    pub fn new(id: i32, tag: i32) -> Self {
        Self { id, tag }
    }

    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.id);
        LittleEndian::write_i32(&mut buf[4..8], self.tag);
        buf
    }

    /// Frame a complete packet.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(Self::SIZE + payload.len());
        packet.extend_from_slice(&self.to_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

/// Acknowledgment from the second-stage loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub result: i32,
    pub tag: i32,
}

impl Ack {
    pub const SIZE: usize = ACK_SIZE;

    pub fn new(result: i32, tag: i32) -> Self {
        Self { result, tag }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() != Self::SIZE {
            return Err(PacketError::BadAckLength {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            result: LittleEndian::read_i32(&data[0..4]),
            tag: LittleEndian::read_i32(&data[4..8]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ACK_SIZE] {
        let mut buf = [0u8; ACK_SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.result);
        LittleEndian::write_i32(&mut buf[4..8], self.tag);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_layout() {
        let packet = PacketHeader::new(3, -2).encode(&[0xAA, 0xBB]);
        assert_eq!(
            packet,
            vec![0x03, 0x00, 0x00, 0x00, 0xFE, 0xFF, 0xFF, 0xFF, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_ack_parse() {
        let ack = Ack::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(ack.result, -1);
        assert_eq!(ack.tag, 0x10);
    }

    #[test]
    fn test_ack_length_checked() {
        assert_eq!(
            Ack::from_bytes(&[0u8; 7]),
            Err(PacketError::BadAckLength {
                expected: 8,
                actual: 7
            })
        );
        assert!(Ack::from_bytes(&[0u8; 9]).is_err());
    }
}
