//! Host side: the fast loader and its collaborators.

pub mod bridge;
pub mod discovery;
pub mod fastload;
pub mod tags;
pub mod terminal;

pub use bridge::{BridgeControl, BridgeError, HttpBridge};
pub use discovery::{DiscoveredModule, discover};
pub use fastload::{FastLoadOptions, FastLoader, LoadError, fast_load, packet_count, program_checksum};
pub use tags::{RandomTags, TagSource};
