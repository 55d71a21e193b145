//! Broadcast routing options.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Delivery modifiers attached to a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFlags {
    /// Deliver on this instance only; the record is never inserted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub local: bool,

    /// The packet was emitted through a broadcast operator.
    #[serde(default, skip_serializing_if = "is_false")]
    pub broadcast: bool,

    /// Drop the packet instead of queueing when the transport is not
    /// writable. Volatile packets are also excluded from session replay.
    #[serde(default, skip_serializing_if = "is_false")]
    pub volatile: bool,

    /// Ask the transport to compress the payload.
    #[serde(default, skip_serializing_if = "is_false")]
    pub compress: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl BroadcastFlags {
    /// Whether every flag is unset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == BroadcastFlags::default()
    }
}

/// Routing of a broadcast: target rooms, excluded rooms, flags.
///
/// `rooms` and `except` are ordered sets, so the encoded form is
/// deterministic and set equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Target rooms; empty means every socket in the namespace.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub rooms: BTreeSet<String>,

    /// Sockets in any of these rooms are excluded.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub except: BTreeSet<String>,

    /// Delivery modifiers.
    #[serde(default, skip_serializing_if = "BroadcastFlags::is_empty")]
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    /// Options targeting every socket in the namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target room.
    #[must_use]
    pub fn to(mut self, room: impl Into<String>) -> Self {
        self.rooms.insert(room.into());
        self
    }

    /// Exclude sockets in a room.
    #[must_use]
    pub fn except(mut self, room: impl Into<String>) -> Self {
        self.except.insert(room.into());
        self
    }

    /// Restrict delivery to this instance.
    #[must_use]
    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    /// Mark the broadcast volatile.
    #[must_use]
    pub fn volatile(mut self) -> Self {
        self.flags.volatile = true;
        self
    }

    /// Whether a socket with the given room membership is targeted.
    ///
    /// Empty `rooms` matches everything; `except` always wins.
    #[must_use]
    pub fn matches(&self, socket_rooms: &BTreeSet<String>) -> bool {
        if self.except.iter().any(|room| socket_rooms.contains(room)) {
            return false;
        }
        self.rooms.is_empty() || self.rooms.iter().any(|room| socket_rooms.contains(room))
    }
}
