//! Message Codes and Headers
//!
//! Every message type carries a fixed 64-bit code. The high bit separates
//! codes reserved by the library from codes chosen by models.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::Identity;
use crate::time::TimePoint;

/// Codes with this bit set are reserved for library message types.
pub const LIBRARY_MASK: u64 = 0x8000_0000_0000_0000;

/// Identifies a message type on the wire and in callback registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageCode(pub u64);

impl MessageCode {
    /// A user-defined code. The high bit must be clear.
    pub const fn user(code: u64) -> Self {
        assert!(code & LIBRARY_MASK == 0, "user message codes must not set the library bit");
        Self(code)
    }

    pub const fn is_library(self) -> bool {
        self.0 & LIBRARY_MASK != 0
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Builds a library-reserved code from an offset.
///
/// Used in a `const` context an oversized offset fails the build.
pub const fn library_code(offset: u64) -> MessageCode {
    assert!(offset < LIBRARY_MASK, "maximum library code offset exceeded");
    MessageCode(LIBRARY_MASK | offset)
}

/// Recovers the offset of a library code, or `None` for user codes.
pub const fn library_offset(code: MessageCode) -> Option<u64> {
    if code.is_library() {
        Some(code.0 & !LIBRARY_MASK)
    } else {
        None
    }
}

/// The delivery information every message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub code: MessageCode,
    pub sender: Identity,
    pub recipient: Identity,
    /// When the sender sent the message.
    pub sent: TimePoint,
    /// Earliest time at which the recipient may process the message.
    pub received: TimePoint,
}

impl Header {
    /// True when the delivery time does not precede the send time.
    pub fn is_causal(&self) -> bool {
        self.received >= self.sent
    }
}
