use std::fmt;

use serde::{Deserialize, Serialize};

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Process-scoped handle for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u32);

/// Reserved sentinel meaning "no connection".
pub const INVALID_CONNECTION_ID: ConnectionId = ConnectionId(u32::MAX);

impl ConnectionId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != INVALID_CONNECTION_ID.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out connection ids in increasing order, skipping the sentinel on wrap.
#[derive(Debug, Clone)]
pub struct ConnectionIdGenerator {
    next: u32,
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> ConnectionId {
        if self.next == INVALID_CONNECTION_ID.0 {
            self.next = 0;
        }
        let id = ConnectionId(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Identifies one unreliable transmission on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(u32);

impl PacketId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wrapping comparison: true when `s1` is newer than `s2`.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}
