//! What the target does with a downloaded image.

use std::fmt;
use std::ops::BitOr;

/// Bitmask over {Run, Program}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LoadType(u8);

impl LoadType {
    /// No operation; the ROM shuts the target down.
    pub const SHUTDOWN: LoadType = LoadType(0);
    pub const RUN: LoadType = LoadType(1 << 0);
    /// Write the image to the boot EEPROM.
    pub const PROGRAM: LoadType = LoadType(1 << 1);
    pub const PROGRAM_AND_RUN: LoadType = LoadType(Self::RUN.0 | Self::PROGRAM.0);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::PROGRAM_AND_RUN.0)
    }

    pub const fn contains(self, other: LoadType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn runs(self) -> bool {
        self.contains(Self::RUN)
    }

    pub fn programs(self) -> bool {
        self.contains(Self::PROGRAM)
    }
}

impl BitOr for LoadType {
    type Output = LoadType;

    fn bitor(self, rhs: LoadType) -> LoadType {
        LoadType(self.0 | rhs.0)
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "Shutdown"),
            1 => write!(f, "Run"),
            2 => write!(f, "Program"),
            _ => write!(f, "ProgramAndRun"),
        }
    }
}
