//! Distributed event-broadcast adapter over a shared capped stream.
//!
//! Any number of socket-server instances tail one capped, time-ordered
//! stream and behave as a single logical fan-out bus: a packet published
//! on one instance reaches matching sockets on every instance, targeted
//! operations and queries fan out as request/response records on the same
//! stream, and clients that reconnect within a grace window get their
//! rooms and missed broadcasts back in order.
//!
//! # Key Types
//!
//! - [`Adapter`] - One adapter per namespace per process
//! - [`AdapterConfig`] - Timeouts, heartbeat cadence, recovery window
//! - [`AdapterError`] / [`AdapterEvent`] - Failures and diagnostics
//!
//! The stream itself is any [`fanout_stream::EventLog`] over JSON
//! documents; the hosting socket framework plugs in through
//! [`fanout_core::SocketHost`].

mod adapter;
mod config;
mod delivery;
mod error;
mod listener;
mod publisher;
mod recovery;
mod rpc;

// Re-exports
pub use adapter::Adapter;
pub use config::AdapterConfig;
pub use error::{AdapterError, AdapterEvent, Result};
