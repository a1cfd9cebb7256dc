//! Propeller image buffer.
//!
//! A loadable program starts with a Spin object header:
//!
//! ```text
//! offset  size  field
//! 0x00    4     clkfreq
//! 0x04    1     clkmode
//! 0x05    1     chksum
//! 0x06    2     pbase
//! 0x08    2     vbase
//! 0x0A    2     dbase
//! 0x0C    2     pcurr
//! 0x0E    2     dcurr
//! ```
//!
//! All multi-byte fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Low byte of the sum of every image byte once the checksum is written.
pub const TARGET_CHECKSUM: u8 = 0x14;

pub const CLKFREQ_OFFSET: usize = 0x00;
pub const CLKMODE_OFFSET: usize = 0x04;
pub const CHKSUM_OFFSET: usize = 0x05;
pub const PBASE_OFFSET: usize = 0x06;
pub const VBASE_OFFSET: usize = 0x08;
pub const DBASE_OFFSET: usize = 0x0A;
pub const PCURR_OFFSET: usize = 0x0C;
pub const DCURR_OFFSET: usize = 0x0E;

/// Size of the Spin object header.
pub const SPIN_HEADER_SIZE: usize = 0x10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Access out of bounds: offset {offset} + {width} exceeds image size {size}")]
    OutOfBounds {
        offset: usize,
        width: usize,
        size: usize,
    },
}

/// An owned program image with little-endian field access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropImage {
    data: Vec<u8>,
}

impl PropImage {
    /// Bind a buffer as an image.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: usize, width: usize) -> Result<std::ops::Range<usize>, ImageError> {
        match offset.checked_add(width) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(ImageError::OutOfBounds {
                offset,
                width,
                size: self.data.len(),
            }),
        }
    }

    pub fn byte(&self, offset: usize) -> Result<u8, ImageError> {
        let r = self.range(offset, 1)?;
        Ok(self.data[r.start])
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) -> Result<(), ImageError> {
        let r = self.range(offset, 1)?;
        self.data[r.start] = value;
        Ok(())
    }

    pub fn word(&self, offset: usize) -> Result<u16, ImageError> {
        let r = self.range(offset, 2)?;
        Ok(LittleEndian::read_u16(&self.data[r]))
    }

    pub fn set_word(&mut self, offset: usize, value: u16) -> Result<(), ImageError> {
        let r = self.range(offset, 2)?;
        LittleEndian::write_u16(&mut self.data[r], value);
        Ok(())
    }

    pub fn long(&self, offset: usize) -> Result<u32, ImageError> {
        let r = self.range(offset, 4)?;
        Ok(LittleEndian::read_u32(&self.data[r]))
    }

    pub fn set_long(&mut self, offset: usize, value: u32) -> Result<(), ImageError> {
        let r = self.range(offset, 4)?;
        LittleEndian::write_u32(&mut self.data[r], value);
        Ok(())
    }

    pub fn clock_freq(&self) -> Result<u32, ImageError> {
        self.long(CLKFREQ_OFFSET)
    }

    pub fn set_clock_freq(&mut self, freq: u32) -> Result<(), ImageError> {
        self.set_long(CLKFREQ_OFFSET, freq)
    }

    pub fn clock_mode(&self) -> Result<u8, ImageError> {
        self.byte(CLKMODE_OFFSET)
    }

    pub fn set_clock_mode(&mut self, mode: u8) -> Result<(), ImageError> {
        self.set_byte(CLKMODE_OFFSET, mode)
    }

    pub fn checksum(&self) -> Result<u8, ImageError> {
        self.byte(CHKSUM_OFFSET)
    }

    pub fn pbase(&self) -> Result<u16, ImageError> {
        self.word(PBASE_OFFSET)
    }

    pub fn vbase(&self) -> Result<u16, ImageError> {
        self.word(VBASE_OFFSET)
    }

    pub fn dbase(&self) -> Result<u16, ImageError> {
        self.word(DBASE_OFFSET)
    }

    pub fn pcurr(&self) -> Result<u16, ImageError> {
        self.word(PCURR_OFFSET)
    }

    pub fn dcurr(&self) -> Result<u16, ImageError> {
        self.word(DCURR_OFFSET)
    }

    /// Recompute the header checksum so the low byte of the image sum equals
    /// [`TARGET_CHECKSUM`].
    ///
    /// Returns the raw byte sum (mod 256) taken with the checksum field zeroed.
    pub fn update_checksum(&mut self) -> Result<u8, ImageError> {
        self.set_byte(CHKSUM_OFFSET, 0)?;
        let sum = byte_sum(&self.data);
        self.set_byte(CHKSUM_OFFSET, TARGET_CHECKSUM.wrapping_sub(sum))?;
        Ok(sum)
    }
}

/// Sum of all bytes, mod 256.
pub fn byte_sum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}
