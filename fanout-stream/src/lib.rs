//! Capped event-log abstraction for the fanout bus.
//!
//! Every instance of the bus shares one capped, time-ordered stream. This
//! crate defines the seam between the adapter and whatever store backs that
//! stream, plus a capped in-memory implementation used for tests and
//! single-node development.
//!
//! # Key Types
//!
//! - [`EventLog`] - Trait for appending records and opening tail cursors
//! - [`EventCursor`] - Trait for consuming records in offset order
//! - [`Offset`] - Monotone record identifier assigned by the store
//! - [`CappedMemoryLog`] - In-memory capped implementation of EventLog

pub mod error;
pub mod memory;
pub mod traits;

// Re-exports
pub use error::{Result, StoreError};
pub use memory::CappedMemoryLog;
pub use traits::{EventCursor, EventLog, Offset, ParseOffsetError, TailPosition};
