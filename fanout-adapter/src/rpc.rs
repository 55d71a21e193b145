//! Request/response coordination across instances.
//!
//! Every request carries a fresh correlation id; peers answer with
//! response (or ack) records on the same stream. The coordinator keeps the
//! pending table and the peer liveness table: expected response counts
//! come from heartbeats, and a peer that goes silent has its contribution
//! subtracted so pending requests settle with what has arrived.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use fanout_core::{InstanceId, RequestId};

use crate::error::AdapterEvent;

pub(crate) struct RpcCoordinator {
    state: Mutex<RpcState>,
    events: broadcast::Sender<AdapterEvent>,
}

#[derive(Default)]
struct RpcState {
    pending: HashMap<RequestId, Pending>,
    peers: HashMap<InstanceId, Instant>,
}

struct Pending {
    expected: usize,
    received: Vec<Value>,
    tx: Option<oneshot::Sender<Vec<Value>>>,
}

impl Pending {
    fn complete(&self) -> bool {
        self.received.len() >= self.expected
    }

    fn settle(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(std::mem::take(&mut self.received));
        }
    }
}

impl RpcCoordinator {
    pub(crate) fn new(events: broadcast::Sender<AdapterEvent>) -> Self {
        Self {
            state: Mutex::new(RpcState::default()),
            events,
        }
    }

    /// Record a heartbeat. Returns `true` for a previously unseen peer.
    pub(crate) fn observe_heartbeat(&self, uid: InstanceId) -> bool {
        let mut state = self.state.lock().unwrap();
        state.peers.insert(uid, Instant::now()).is_none()
    }

    /// Peers with a heartbeat within the given window.
    pub(crate) fn alive_peers(&self, timeout: Duration) -> usize {
        let state = self.state.lock().unwrap();
        state
            .peers
            .values()
            .filter(|seen| seen.elapsed() < timeout)
            .count()
    }

    /// Register a pending request expecting `expected` responses. The
    /// receiver resolves when they have all arrived; with no peers it
    /// resolves immediately.
    pub(crate) fn register(
        &self,
        request_id: RequestId,
        expected: usize,
    ) -> oneshot::Receiver<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        if expected == 0 {
            let _ = tx.send(Vec::new());
            return rx;
        }
        let mut state = self.state.lock().unwrap();
        state.pending.insert(
            request_id,
            Pending {
                expected,
                received: Vec::new(),
                tx: Some(tx),
            },
        );
        rx
    }

    /// Feed one response (or ack aggregate) into its pending request.
    /// Responses without a pending entry are late or foreign; dropped.
    pub(crate) fn on_response(&self, request_id: RequestId, data: Value) {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.pending.get_mut(&request_id) else {
            debug!(%request_id, "response without pending request dropped");
            return;
        };
        pending.received.push(data);
        if pending.complete() {
            pending.settle();
            state.pending.remove(&request_id);
        }
    }

    /// Deadline expiry: resolve with the partial set collected so far.
    pub(crate) fn timed_out(&self, request_id: RequestId) -> Vec<Value> {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.pending.remove(&request_id) else {
            return Vec::new();
        };
        warn!(
            %request_id,
            received = pending.received.len(),
            expected = pending.expected,
            "operation has timed out, resolving with partial responses"
        );
        let _ = self.events.send(AdapterEvent::OperationTimeout {
            request_id,
            received: pending.received.len(),
            expected: pending.expected,
        });
        pending.received
    }

    /// Drop a pending request without resolving it (publish failed, or
    /// the caller went away).
    pub(crate) fn discard(&self, request_id: RequestId) {
        self.state.lock().unwrap().pending.remove(&request_id);
    }

    /// Drop peers that missed their heartbeats and subtract their
    /// contribution from every pending request, settling the ones that
    /// are now complete.
    pub(crate) fn sweep_peers(&self, timeout: Duration) {
        let mut state = self.state.lock().unwrap();
        let dead: Vec<InstanceId> = state
            .peers
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= timeout)
            .map(|(uid, _)| *uid)
            .collect();
        if dead.is_empty() {
            return;
        }
        for uid in &dead {
            state.peers.remove(uid);
            info!(%uid, "peer considered gone");
            let _ = self.events.send(AdapterEvent::PeerDown { uid: *uid });
        }

        let settled: Vec<RequestId> = state
            .pending
            .iter_mut()
            .filter_map(|(request_id, pending)| {
                pending.expected = pending.expected.saturating_sub(dead.len());
                if pending.complete() {
                    pending.settle();
                    Some(*request_id)
                } else {
                    None
                }
            })
            .collect();
        for request_id in settled {
            state.pending.remove(&request_id);
        }
    }
}
