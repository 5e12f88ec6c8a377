//! Branded identifiers.
//!
//! Local correlation indices, local subscription ids and peer-assigned
//! subscription indices are all `u64` on the wire, so each gets its own
//! newtype to keep the namespaces apart.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw index.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw index as it appears on the wire.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

numeric_id!(
    /// Locally assigned index joining a request frame to its response.
    CorrelationId
);
numeric_id!(
    /// Locally assigned identity of a subscription record; stable across reconnects.
    SubscriptionId
);
numeric_id!(
    /// Index chosen by the peer in a subscribe ack. Valid only for the
    /// transport that carried the ack.
    PeerSubscriptionId
);

/// Monotonic allocator for numeric ids. Never reuses a value.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Create an allocator starting at zero.
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Hand out the next raw value.
    pub fn next_raw(&mut self) -> u64 {
        let raw = self.next;
        self.next += 1;
        raw
    }

    /// The value the next call will return.
    pub const fn peek(&self) -> u64 {
        self.next
    }
}

/// Identity of one transport lifetime, used to tag log lines.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh, time-ordered id.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
