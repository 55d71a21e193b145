//! Adapter configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for one namespace adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Override the generated instance id. Useful when several namespace
    /// adapters in one process should share an identity.
    #[serde(default)]
    pub uid: Option<Uuid>,

    /// Deadline for request/response operations. Expiry resolves with the
    /// responses collected so far.
    #[serde(default = "default_requests_timeout", with = "humantime_serde")]
    pub requests_timeout: Duration,

    /// Cadence of the liveness beacon.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which a peer is considered gone.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Write `createdAt` on every record for store-side TTL pruning.
    #[serde(default = "default_true")]
    pub add_created_at_field: bool,

    /// Grace window during which an abruptly disconnected session can be
    /// restored.
    #[serde(default = "default_max_disconnection", with = "humantime_serde")]
    pub max_disconnection_duration: Duration,

    /// Also persist recoverable sessions to the stream, so they survive
    /// the instance that held them.
    #[serde(default = "default_true")]
    pub persist_sessions: bool,

    /// How many records before the stream tail the listener starts from,
    /// to paper over store-side ordering skew at the cap boundary.
    #[serde(default = "default_overlap_margin")]
    pub overlap_margin: u64,

    /// Capacity of the recently-seen-offset window that suppresses
    /// duplicates caused by the overlap margin and cursor resumes.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Insert attempts before a publish gives up.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

fn default_requests_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_disconnection() -> Duration {
    Duration::from_secs(120)
}

fn default_overlap_margin() -> u64 {
    8
}

fn default_dedup_capacity() -> usize {
    1024
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            uid: None,
            requests_timeout: default_requests_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            add_created_at_field: true,
            max_disconnection_duration: default_max_disconnection(),
            persist_sessions: true,
            overlap_margin: default_overlap_margin(),
            dedup_capacity: default_dedup_capacity(),
            publish_attempts: default_publish_attempts(),
        }
    }
}

impl AdapterConfig {
    /// Pin the instance id instead of generating one.
    #[must_use]
    pub fn with_uid(mut self, uid: Uuid) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Set the request deadline.
    #[must_use]
    pub fn with_requests_timeout(mut self, timeout: Duration) -> Self {
        self.requests_timeout = timeout;
        self
    }

    /// Set the heartbeat cadence and peer-gone threshold together.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the session recovery grace window.
    #[must_use]
    pub fn with_max_disconnection_duration(mut self, grace: Duration) -> Self {
        self.max_disconnection_duration = grace;
        self
    }

    /// Keep recoverable sessions in process memory only.
    #[must_use]
    pub fn without_session_persistence(mut self) -> Self {
        self.persist_sessions = false;
        self
    }
}
