//! Protocol module - wire definitions shared by the host and bridge engines.

pub mod constants;
pub mod load_type;
pub mod loader;
pub mod packet;

pub use constants::*;
pub use load_type::LoadType;
pub use loader::{BitTimings, LoaderBundle, LoaderError, generate_loader_image};
pub use packet::{Ack, PacketHeader};
