//! SeedLink v3/v4 protocol engine shared by the client and server crates.
//!
//! - [`codec`]: resumable command-line and packet framing
//! - [`select`]: STATION/SELECT patterns compiled into a matcher
//! - [`session`]: per-connection state machine
//! - [`record`]: station ids, stream keys, and records

pub mod capability;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod info;
pub mod record;
pub mod response;
pub mod select;
pub mod sequence;
pub mod session;
pub mod time;
pub mod version;

pub use capability::{Capability, CapabilityRequest, CapabilitySet};
pub use codec::{Codec, Decoded, Packet};
pub use command::Command;
pub use error::{Result, SeedlinkError};
pub use frame::{PayloadFormat, PayloadSubformat, RawFrame};
pub use info::{GapNotice, InfoDocument, InfoLevel};
pub use record::{Record, StationId, StreamKey};
pub use response::{ErrorCode, Response};
pub use select::{Selector, SelectorBuilder, StartPoint, StationPattern, StationSelector};
pub use sequence::SequenceNumber;
pub use session::{Session, SessionState, Transition};
pub use time::{TimeWindow, Timestamp};
pub use version::ProtocolVersion;
