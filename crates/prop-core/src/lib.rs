//! prop-core: network loading for Propeller P8X32A targets.
//!
//! A target sits behind a Wi-Fi serial bridge. Loading happens in two halves
//! that speak the same wire protocol from opposite ends:
//!
//! - **Host**: [`host::fast_load`] pushes a small second-stage loader through
//!   the bridge's slow ROM-protocol path, then streams the program as tagged,
//!   acknowledged packets over TCP.
//! - **Bridge**: [`device::Connection`] sequences reset, the boot ROM
//!   handshake, segmented streaming and checksum polling as a pure
//!   event-to-actions state machine.
//!
//! # Architecture
//!
//! - **Image**: Spin header fields and checksum
//! - **Protocol**: Constants, load types, packet framing, loader patching
//! - **Transport**: Packet channel abstraction (TCP, mock)
//! - **Host**: Fast loader, bridge control, terminal relay and discovery
//! - **Device**: Boot ROM link and the load state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Configuration and high-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use prop_core::protocol::LoadType;
//! use prop_core::session::{LoadSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     loader_bundle: Some("loader/bundle.toml".into()),
//!     ..Default::default()
//! };
//!
//! let session = LoadSession::new("192.168.4.1", config);
//! session
//!     .load("blink.binary".as_ref(), LoadType::RUN)
//!     .expect("load failed");
//! ```

pub mod device;
pub mod events;
pub mod host;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use device::{Action, Connection, Event, LoadDriver, LoadOutcome, LoadRequest, LoadState};
pub use events::{LoadEvent, LoadObserver, LoadPhase, TracingObserver};
pub use host::{FastLoader, LoadError, fast_load};
pub use image::{ImageError, PropImage};
pub use protocol::LoadType;
pub use session::{LoadSession, SessionConfig};
pub use transport::{MockTransport, PacketTransport, TcpTransport, TransportError};
