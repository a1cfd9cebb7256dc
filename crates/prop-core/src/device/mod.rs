//! Bridge side: the load state machine that runs next to the target.

pub mod connection;
pub mod driver;
pub mod link;
pub mod source;
pub mod state;

pub use connection::{
    Action, Connection, Event, LoadOutcome, LoadRequest, STATUS_BAD_REQUEST, STATUS_OK, StartError,
};
pub use driver::{BridgeHal, LoadDriver};
pub use link::{LinkError, PropellerLink, TargetLink};
pub use source::{FsImageFile, ImageFile, ImageSource, ImageStream};
pub use state::LoadState;
