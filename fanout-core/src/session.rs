//! Per-connection session state.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fanout_stream::Offset;

use crate::record::SessionRow;

/// Socket id assigned by the hosting framework.
///
/// Every connected socket also occupies a room named by its own sid, which
/// is how single-socket operations compose with room routing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(pub String);

impl SocketId {
    /// The implicit room holding only this socket.
    #[must_use]
    pub fn room(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        SocketId(s.to_string())
    }
}

impl From<String> for SocketId {
    fn from(s: String) -> Self {
        SocketId(s)
    }
}

/// Opaque credential a client presents to claim an existing session.
pub type PrivateId = Uuid;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected; deliveries advance the offset.
    Live,
    /// Abruptly disconnected; restorable until the grace window elapses.
    Recoverable,
    /// Grace window elapsed; kept only until the next sweep.
    Expired,
}

/// Recovery state of one client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id from the host, stable across a successful recovery.
    pub sid: SocketId,
    /// Recovery credential returned to the client.
    pub pid: PrivateId,
    /// Namespace the session lives in.
    pub nsp: String,
    /// Room membership, snapshotted at disconnect time.
    pub rooms: BTreeSet<String>,
    /// Offset of the last packet transmitted to this session. Only ever
    /// advances.
    pub last_offset: Offset,
    /// Set while the session is recoverable.
    pub disconnected_at: Option<DateTime<Utc>>,
    pub state: SessionState,
}

impl Session {
    /// A fresh live session with a random private id.
    #[must_use]
    pub fn new(sid: SocketId, nsp: impl Into<String>, offset: Offset) -> Self {
        Self {
            sid,
            pid: Uuid::new_v4(),
            nsp: nsp.into(),
            rooms: BTreeSet::new(),
            last_offset: offset,
            disconnected_at: None,
            state: SessionState::Live,
        }
    }

    /// Record a successful transmission. Offsets never regress.
    pub fn advance(&mut self, offset: Offset) {
        if offset > self.last_offset {
            self.last_offset = offset;
        }
    }

    /// Abrupt disconnect: snapshot rooms and start the grace window.
    pub fn suspend(&mut self, rooms: BTreeSet<String>, now: DateTime<Utc>) {
        self.rooms = rooms;
        self.disconnected_at = Some(now);
        self.state = SessionState::Recoverable;
    }

    /// Successful recovery: back to live delivery.
    pub fn resume(&mut self) {
        self.disconnected_at = None;
        self.state = SessionState::Live;
    }

    /// Whether the grace window has elapsed.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match (self.state, self.disconnected_at) {
            (SessionState::Expired, _) => true,
            (SessionState::Recoverable, Some(at)) => {
                now.signed_duration_since(at).to_std().unwrap_or_default() >= grace
            }
            _ => false,
        }
    }

    /// The persisted form of a recoverable session.
    #[must_use]
    pub fn to_row(&self) -> Option<SessionRow> {
        let disconnected_at = self.disconnected_at?;
        Some(SessionRow {
            sid: self.sid.clone(),
            pid: self.pid,
            rooms: self.rooms.clone(),
            last_offset: self.last_offset,
            disconnected_at,
        })
    }

    /// Rebuild a recoverable session from its persisted form.
    #[must_use]
    pub fn from_row(row: SessionRow, nsp: impl Into<String>) -> Self {
        Self {
            sid: row.sid,
            pid: row.pid,
            nsp: nsp.into(),
            rooms: row.rooms,
            last_offset: row.last_offset,
            disconnected_at: Some(row.disconnected_at),
            state: SessionState::Recoverable,
        }
    }
}
