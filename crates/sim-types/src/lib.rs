//! Shared data types for the agent simulation kernel.
//!
//! This crate contains pure data structures with no simulation logic:
//! identities, simulation time, message codes and headers, and the records
//! nodes exchange to keep a consistent view of agent ownership.

pub mod identity;
pub mod message;
pub mod protocol;
pub mod time;

#[cfg(feature = "test-fixtures")]
pub mod fixtures;

pub use identity::{Digit, Identity, ParseIdentityError};
pub use message::{library_code, library_offset, Header, MessageCode, LIBRARY_MASK};
pub use protocol::{Activation, Deactivation, Migration, NodeId};
pub use time::{TimeDuration, TimeError, TimeInterval, TimePoint};
