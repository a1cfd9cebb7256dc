//! Second-stage loader bundle and bootstrap image patching.
//!
//! The second-stage loader is a small PASM program sent with the slow ROM
//! protocol. Before it is sent, a block of longs near the end of its image is
//! patched with timing values computed by the host:
//!
//! ```text
//! init_offset = len - 48
//! +4   initial bit time
//! +8   final bit time
//! +12  1.5x final bit time minus max start-bit sense error
//! +16  failsafe timeout
//! +20  end-of-packet timeout
//! +36  expected packet id (total packet count)
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::constants::{
    FAILSAFE_TIMEOUT_SECS, LOADER_INIT_OFFSET_FROM_END, MAX_RX_SENSE_ERROR,
};
use crate::image::{ImageError, PropImage, SPIN_HEADER_SIZE};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Loader template too small: {actual} bytes, minimum {minimum}")]
    TemplateTooSmall { actual: usize, minimum: usize },
    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(u32),
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("Failed to read loader bundle {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse loader bundle: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loader template plus the control payloads it understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderBundle {
    pub image: Vec<u8>,
    pub verify_ram: Vec<u8>,
    pub program_verify_eeprom: Vec<u8>,
    pub ready_to_launch: Vec<u8>,
    pub launch_now: Vec<u8>,
}

/// On-disk description of a bundle. `image` is relative to the bundle file.
#[derive(Debug, Serialize, Deserialize)]
struct BundleManifest {
    image: PathBuf,
    verify_ram: Vec<u8>,
    program_verify_eeprom: Vec<u8>,
    ready_to_launch: Vec<u8>,
    launch_now: Vec<u8>,
}

impl LoaderBundle {
    /// Load a bundle manifest (TOML) and the loader image it points to.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LoaderError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: BundleManifest = toml::from_str(&content)?;

        let image_path = match path.parent() {
            Some(dir) if manifest.image.is_relative() => dir.join(&manifest.image),
            _ => manifest.image.clone(),
        };
        let image = std::fs::read(&image_path).map_err(|source| LoaderError::Read {
            path: image_path.clone(),
            source,
        })?;
        debug!(path = %image_path.display(), size = image.len(), "Loaded loader template");

        Ok(Self {
            image,
            verify_ram: manifest.verify_ram,
            program_verify_eeprom: manifest.program_verify_eeprom,
            ready_to_launch: manifest.ready_to_launch,
            launch_now: manifest.launch_now,
        })
    }
}

/// Host-computed timing values, in target clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTimings {
    pub initial_bit_time: u32,
    pub final_bit_time: u32,
    pub start_bit_wait: u32,
    pub failsafe_timeout: u32,
    pub end_of_packet_timeout: u32,
}

impl BitTimings {
    pub fn new(clock_speed: u32, initial_baud: u32, final_baud: u32) -> Result<Self, LoaderError> {
        if initial_baud == 0 {
            return Err(LoaderError::InvalidBaudRate(initial_baud));
        }
        if final_baud == 0 {
            return Err(LoaderError::InvalidBaudRate(final_baud));
        }
        let clock = f64::from(clock_speed);
        let initial = f64::from(initial_baud);
        let fin = f64::from(final_baud);

        Ok(Self {
            initial_bit_time: round(clock / initial),
            final_bit_time: round(clock / fin),
            start_bit_wait: round(1.5 * clock / fin - MAX_RX_SENSE_ERROR),
            // The loader's receive loop takes 3 instructions of 4 cycles.
            failsafe_timeout: round(FAILSAFE_TIMEOUT_SECS * clock / (3.0 * 4.0)),
            // Two bytes' worth of receive loop iterations.
            end_of_packet_timeout: round((2.0 * clock / fin) * (10.0 / 12.0)),
        })
    }
}

fn round(value: f64) -> u32 {
    (value + 0.5).trunc() as u32
}

/// Offset of the host-initialised block inside a loader template.
pub fn init_offset(template_len: usize) -> Result<usize, LoaderError> {
    let minimum = LOADER_INIT_OFFSET_FROM_END.max(SPIN_HEADER_SIZE);
    if template_len < minimum {
        return Err(LoaderError::TemplateTooSmall {
            actual: template_len,
            minimum,
        });
    }
    Ok(template_len - LOADER_INIT_OFFSET_FROM_END)
}

/// Copy the template, patch the timing block and packet count, and fix up
/// the checksum.
pub fn generate_loader_image(
    template: &[u8],
    timings: &BitTimings,
    packet_count: i32,
) -> Result<PropImage, LoaderError> {
    let offset = init_offset(template.len())?;
    let mut image = PropImage::new(template.to_vec());

    image.set_long(offset + 4, timings.initial_bit_time)?;
    image.set_long(offset + 8, timings.final_bit_time)?;
    image.set_long(offset + 12, timings.start_bit_wait)?;
    image.set_long(offset + 16, timings.failsafe_timeout)?;
    image.set_long(offset + 20, timings.end_of_packet_timeout)?;
    image.set_long(offset + 36, packet_count as u32)?;
    image.update_checksum()?;

    debug!(
        offset,
        packet_count,
        initial_bit_time = timings.initial_bit_time,
        final_bit_time = timings.final_bit_time,
        "Patched loader image"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{TARGET_CHECKSUM, byte_sum};

    #[test]
    fn test_bit_timings() {
        let t = BitTimings::new(80_000_000, 115_200, 921_600).unwrap();
        assert_eq!(t.initial_bit_time, 694);
        assert_eq!(t.final_bit_time, 87);
        assert_eq!(t.start_bit_wait, 107);
        assert_eq!(t.failsafe_timeout, 13_333_333);
        assert_eq!(t.end_of_packet_timeout, 145);
    }

    #[test]
    fn test_zero_baud_rejected() {
        assert!(matches!(
            BitTimings::new(80_000_000, 0, 921_600),
            Err(LoaderError::InvalidBaudRate(0))
        ));
    }

    #[test]
    fn test_generate_loader_image() {
        let template = vec![0u8; 256];
        let t = BitTimings::new(80_000_000, 115_200, 921_600).unwrap();
        let image = generate_loader_image(&template, &t, 7).unwrap();

        let base = 256 - 48;
        assert_eq!(image.long(base + 4).unwrap(), 694);
        assert_eq!(image.long(base + 8).unwrap(), 87);
        assert_eq!(image.long(base + 36).unwrap(), 7);
        assert_eq!(byte_sum(image.as_bytes()), TARGET_CHECKSUM);
        // Template is untouched.
        assert!(template.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_template_too_small() {
        let t = BitTimings::new(80_000_000, 115_200, 115_200).unwrap();
        assert!(matches!(
            generate_loader_image(&[0u8; 40], &t, 1),
            Err(LoaderError::TemplateTooSmall { .. })
        ));
    }

    #[test]
    fn test_bundle_load_from_file() {
        let dir = std::env::temp_dir().join(format!("prop-bundle-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("loader.bin"), [1u8, 2, 3, 4]).unwrap();
        std::fs::write(
            dir.join("loader.toml"),
            "image = \"loader.bin\"\n\
             verify_ram = [1, 2]\n\
             program_verify_eeprom = [3]\n\
             ready_to_launch = [4]\n\
             launch_now = [5, 6]\n",
        )
        .unwrap();

        let bundle = LoaderBundle::load_from_file(dir.join("loader.toml")).unwrap();
        assert_eq!(bundle.image, vec![1, 2, 3, 4]);
        assert_eq!(bundle.verify_ram, vec![1, 2]);
        assert_eq!(bundle.launch_now, vec![5, 6]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
