//! Adapter error taxonomy and diagnostic events.

use fanout_core::{DeliveryError, InstanceId, MalformedRecord, RequestId, SocketId};
use fanout_stream::StoreError;

/// Errors surfaced by adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// A store read failed transiently; the caller may retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),

    /// A record could not be inserted within the configured attempts.
    /// Local delivery has still been attempted.
    #[error("publish failed after {attempts} attempts: {source}")]
    PublishFailed { attempts: u32, source: StoreError },

    /// The stream cursor cannot be reopened. Fatal: the host decides
    /// whether to restart.
    #[error("stream gone: {0}")]
    StreamGone(String),

    /// A stream row did not decode as a record.
    #[error(transparent)]
    Malformed(#[from] MalformedRecord),

    /// No recoverable session for the presented private id.
    #[error("unknown session")]
    SessionUnknown,

    /// The presented offset does not parse, or is older than the oldest
    /// retained record.
    #[error("invalid offset: {0}")]
    OffsetInvalid(String),

    /// No instance, local or remote, knows the socket.
    #[error("socket not found: {0}")]
    SocketNotFound(SocketId),

    /// A per-socket send failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Diagnostics emitted on the adapter's event channel.
///
/// None of these abort the dispatch loop; `StreamGone` is the only fatal
/// condition and the listener has already stopped when it is emitted.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A record insert gave up after its configured attempts.
    PublishFailed { kind: &'static str },

    /// A request hit its deadline and resolved with partial responses.
    OperationTimeout {
        request_id: RequestId,
        received: usize,
        expected: usize,
    },

    /// A peer missed enough heartbeats to be considered gone; its pending
    /// contributions were dropped.
    PeerDown { uid: InstanceId },

    /// The stream cursor could not be reopened.
    StreamGone { reason: String },
}
