//! Hive Protocol: message set and wire framing.

pub mod codec;
pub mod message;

pub use codec::{HiveCodec, ProtocolError};
pub use message::{HiveMessage, TaskAssignment, TaskOutcome, TaskRef, PROTOCOL_VERSION};
