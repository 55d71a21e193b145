//! Wire model and host-framework contract for the fanout bus.
//!
//! The bus federates socket-server instances over one capped event stream.
//! This crate holds everything both sides of that stream agree on: the
//! record codec, broadcast routing options, session state, and the trait
//! the hosting socket framework implements.
//!
//! # Key Types
//!
//! - [`Record`] / [`RecordPayload`] - One row of the shared stream
//! - [`BroadcastOptions`] - `(rooms, except, flags)` routing of a broadcast
//! - [`Session`] - Per-connection recovery state
//! - [`SocketHost`] - Contract the hosting framework implements
//! - [`MockHost`] - Scriptable in-memory host for tests

pub mod host;
pub mod options;
pub mod packet;
pub mod record;
pub mod session;

// Re-exports
pub use host::{DeliveryError, MockHost, SocketHost, SocketView};
pub use options::{BroadcastFlags, BroadcastOptions};
pub use packet::Packet;
pub use record::{
    InstanceId, MalformedRecord, Record, RecordPayload, RequestFrame, RequestId, RequestOp,
    ResponseFrame, SessionRow,
};
pub use session::{PrivateId, Session, SessionState, SocketId};
