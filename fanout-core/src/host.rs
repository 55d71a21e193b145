//! Contract between the bus and the hosting socket framework.
//!
//! The host owns the actual connections: the room registry, the
//! per-socket send primitive, and the namespace-level listeners. The bus
//! only observes membership and hands packets over. [`MockHost`] allows
//! scripting host behavior for unit tests, enabling fast, deterministic
//! testing of delivery and recovery logic.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::options::{BroadcastFlags, BroadcastOptions};
use crate::packet::Packet;
use crate::session::SocketId;

/// A per-socket operation failed (closed transport, unknown socket).
///
/// Delivery errors are isolated: a failed send never aborts delivery to
/// other sockets.
#[derive(Debug, Clone, thiserror::Error)]
#[error("delivery to {sid} failed: {reason}")]
pub struct DeliveryError {
    pub sid: SocketId,
    pub reason: String,
}

/// Serialized view of a connected socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketView {
    pub sid: SocketId,
    pub rooms: BTreeSet<String>,
    #[serde(default)]
    pub data: Value,
}

/// What the bus needs from the hosting socket framework.
///
/// Registry methods are synchronous: membership lives in process memory.
/// Sends are asynchronous and may suspend under transport backpressure.
#[async_trait]
pub trait SocketHost: Send + Sync {
    /// Join a socket to each of the given rooms.
    fn add_all(&self, sid: &SocketId, rooms: &BTreeSet<String>);

    /// Remove a socket from a room.
    fn del(&self, sid: &SocketId, room: &str);

    /// Remove a socket from every room.
    fn del_all(&self, sid: &SocketId);

    /// Sockets in any of the given rooms; an empty filter means every
    /// socket in the namespace.
    fn sockets(&self, rooms: &BTreeSet<String>) -> BTreeSet<SocketId>;

    /// Rooms a socket is in, or `None` when the socket is not local.
    fn socket_rooms(&self, sid: &SocketId) -> Option<BTreeSet<String>>;

    /// Every room name known to the namespace.
    fn rooms(&self) -> BTreeSet<String>;

    /// Serialized views of the sockets matching a filter.
    fn fetch(&self, opts: &BroadcastOptions) -> Vec<SocketView>;

    /// Hand a packet to one socket's transport.
    async fn send(
        &self,
        sid: &SocketId,
        packet: &Packet,
        flags: &BroadcastFlags,
    ) -> Result<(), DeliveryError>;

    /// Hand a packet to one socket's transport and wait for the client's
    /// ack value.
    async fn send_with_ack(
        &self,
        sid: &SocketId,
        packet: &Packet,
        flags: &BroadcastFlags,
    ) -> Result<Value, DeliveryError>;

    /// Disconnect a socket, optionally closing the underlying transport.
    fn disconnect(&self, sid: &SocketId, close: bool) -> Result<(), DeliveryError>;

    /// Invoke the namespace-level listeners, returning a reply when one is
    /// produced.
    async fn server_side_emit(&self, args: Vec<Value>) -> Option<Value>;
}

/// Scriptable in-memory implementation of [`SocketHost`].
///
/// Connect sockets with [`MockHost::connect`], then inspect what was sent
/// with [`MockHost::sent`] / [`MockHost::sent_to`]. Sends can be made to
/// fail per socket, acks and server-side-emit replies can be scripted.
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    membership: HashMap<SocketId, BTreeSet<String>>,
    data: HashMap<SocketId, Value>,
    sent: Vec<(SocketId, Packet)>,
    acks: HashMap<SocketId, Value>,
    failing: HashSet<SocketId>,
    disconnected: Vec<(SocketId, bool)>,
    emitted: Vec<Vec<Value>>,
    emit_reply: Option<Value>,
}

impl MockHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a socket. It starts out in the room named by its own sid.
    pub fn connect(&self, sid: impl Into<SocketId>) -> SocketId {
        let sid = sid.into();
        let mut state = self.state.lock().unwrap();
        state
            .membership
            .insert(sid.clone(), BTreeSet::from([sid.room()]));
        sid
    }

    /// Attach view data to a connected socket.
    pub fn set_data(&self, sid: &SocketId, data: Value) {
        self.state.lock().unwrap().data.insert(sid.clone(), data);
    }

    /// Script the ack value a socket replies with.
    pub fn set_ack(&self, sid: &SocketId, value: Value) {
        self.state.lock().unwrap().acks.insert(sid.clone(), value);
    }

    /// Make every send to a socket fail.
    pub fn fail_socket(&self, sid: &SocketId) {
        self.state.lock().unwrap().failing.insert(sid.clone());
    }

    /// Script the reply of the namespace-level listeners.
    pub fn set_emit_reply(&self, value: Value) {
        self.state.lock().unwrap().emit_reply = Some(value);
    }

    /// Every packet sent so far, in send order.
    pub fn sent(&self) -> Vec<(SocketId, Packet)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Packets sent to one socket, in send order.
    pub fn sent_to(&self, sid: &SocketId) -> Vec<Packet> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(s, _)| s == sid)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Sockets disconnected so far, with their close flag.
    pub fn disconnected(&self) -> Vec<(SocketId, bool)> {
        self.state.lock().unwrap().disconnected.clone()
    }

    /// Arguments handed to the namespace-level listeners so far.
    pub fn emitted(&self) -> Vec<Vec<Value>> {
        self.state.lock().unwrap().emitted.clone()
    }
}

#[async_trait]
impl SocketHost for MockHost {
    fn add_all(&self, sid: &SocketId, rooms: &BTreeSet<String>) {
        let mut state = self.state.lock().unwrap();
        let membership = state.membership.entry(sid.clone()).or_default();
        membership.insert(sid.room());
        membership.extend(rooms.iter().cloned());
    }

    fn del(&self, sid: &SocketId, room: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(membership) = state.membership.get_mut(sid) {
            membership.remove(room);
        }
    }

    fn del_all(&self, sid: &SocketId) {
        self.state.lock().unwrap().membership.remove(sid);
    }

    fn sockets(&self, rooms: &BTreeSet<String>) -> BTreeSet<SocketId> {
        let state = self.state.lock().unwrap();
        state
            .membership
            .iter()
            .filter(|(_, membership)| {
                rooms.is_empty() || rooms.iter().any(|room| membership.contains(room))
            })
            .map(|(sid, _)| sid.clone())
            .collect()
    }

    fn socket_rooms(&self, sid: &SocketId) -> Option<BTreeSet<String>> {
        self.state.lock().unwrap().membership.get(sid).cloned()
    }

    fn rooms(&self) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        state
            .membership
            .values()
            .flat_map(|membership| membership.iter().cloned())
            .collect()
    }

    fn fetch(&self, opts: &BroadcastOptions) -> Vec<SocketView> {
        let state = self.state.lock().unwrap();
        let mut views: Vec<SocketView> = state
            .membership
            .iter()
            .filter(|(_, membership)| opts.matches(membership))
            .map(|(sid, membership)| SocketView {
                sid: sid.clone(),
                rooms: membership.clone(),
                data: state.data.get(sid).cloned().unwrap_or(Value::Null),
            })
            .collect();
        views.sort_by(|a, b| a.sid.cmp(&b.sid));
        views
    }

    async fn send(
        &self,
        sid: &SocketId,
        packet: &Packet,
        _flags: &BroadcastFlags,
    ) -> Result<(), DeliveryError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(sid) {
            return Err(DeliveryError {
                sid: sid.clone(),
                reason: "transport closed".to_string(),
            });
        }
        if !state.membership.contains_key(sid) {
            return Err(DeliveryError {
                sid: sid.clone(),
                reason: "unknown socket".to_string(),
            });
        }
        state.sent.push((sid.clone(), packet.clone()));
        Ok(())
    }

    async fn send_with_ack(
        &self,
        sid: &SocketId,
        packet: &Packet,
        flags: &BroadcastFlags,
    ) -> Result<Value, DeliveryError> {
        self.send(sid, packet, flags).await?;
        let state = self.state.lock().unwrap();
        Ok(state.acks.get(sid).cloned().unwrap_or(Value::Null))
    }

    fn disconnect(&self, sid: &SocketId, close: bool) -> Result<(), DeliveryError> {
        let mut state = self.state.lock().unwrap();
        if state.membership.remove(sid).is_none() {
            return Err(DeliveryError {
                sid: sid.clone(),
                reason: "unknown socket".to_string(),
            });
        }
        state.disconnected.push((sid.clone(), close));
        Ok(())
    }

    async fn server_side_emit(&self, args: Vec<Value>) -> Option<Value> {
        let mut state = self.state.lock().unwrap();
        state.emitted.push(args);
        state.emit_reply.clone()
    }
}
