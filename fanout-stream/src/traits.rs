//! Core traits for the shared event stream.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Monotone identifier assigned by the store when a record is inserted.
///
/// Offsets are strictly increasing across all writers, so they double as a
/// resumable cursor and a replay boundary. The first record of a stream is
/// assigned offset 1; `Offset::ZERO` therefore sorts before every record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    /// Sorts before every stored record.
    pub const ZERO: Offset = Offset(0);

    /// The offset `n` positions back, saturating at zero.
    #[must_use]
    pub fn back(self, n: u64) -> Offset {
        Offset(self.0.saturating_sub(n))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Offset {
    type Err = ParseOffsetError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Offset)
            .map_err(|_| ParseOffsetError(s.to_string()))
    }
}

/// A string presented as an offset did not parse as one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("not a valid stream offset: {0:?}")]
pub struct ParseOffsetError(pub String);

/// Position to start a tail cursor from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailPosition {
    /// Start from the oldest retained record.
    Oldest,
    /// Start strictly after the given offset.
    After(Offset),
    /// Start after the newest record present at open time (new records only).
    Latest,
}

/// Trait for appending records to the capped stream and reading them back.
///
/// The store is the sole arbiter of offset assignment; implementations must
/// hand out strictly increasing offsets across concurrent writers.
#[async_trait]
pub trait EventLog<E>: Send + Sync {
    /// Append a record, returning the offset the store assigned to it.
    async fn append(&self, event: &E) -> Result<Offset>;

    /// Offset of the oldest retained record, if any.
    async fn oldest(&self) -> Result<Option<Offset>>;

    /// Offset of the newest record, if any.
    async fn latest(&self) -> Result<Option<Offset>>;

    /// All retained records with an offset strictly greater than `offset`,
    /// in ascending offset order.
    async fn after(&self, offset: Offset) -> Result<Vec<(Offset, E)>>;

    /// The most recent retained record matching `pred`, if any.
    async fn rfind(&self, pred: &(dyn for<'a> Fn(&'a E) -> bool + Sync)) -> Result<Option<(Offset, E)>>;

    /// Open a cursor that yields records in offset order, waiting for new
    /// appends once it reaches the tail.
    async fn tail(&self, position: TailPosition) -> Result<Box<dyn EventCursor<E>>>;
}

/// A tail cursor over the stream.
#[async_trait]
pub trait EventCursor<E>: Send {
    /// The next record past the cursor position. Waits when the cursor is
    /// at the tail. Cancel-safe: dropping the future does not advance the
    /// cursor.
    async fn next(&mut self) -> Result<(Offset, E)>;

    /// The offset of the last record this cursor yielded, used to resume
    /// after a cursor error.
    fn position(&self) -> Option<Offset>;
}
