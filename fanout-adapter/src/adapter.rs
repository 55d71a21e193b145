//! The namespace adapter.
//!
//! One `Adapter` per namespace per process. All adapters share the capped
//! stream: a broadcast published here is applied by every other instance,
//! requests fan out to peers and aggregate their responses, and
//! reconnecting clients get their session restored with the broadcasts
//! they missed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use fanout_core::{
    BroadcastOptions, InstanceId, Packet, PrivateId, Record, RecordPayload, RequestFrame,
    RequestId, RequestOp, ResponseFrame, Session, SocketHost, SocketId, SocketView,
};
use fanout_stream::{EventLog, Offset};

use crate::config::AdapterConfig;
use crate::delivery::LocalDelivery;
use crate::error::{AdapterError, AdapterEvent, Result};
use crate::listener::{RecordHandler, spawn_listener};
use crate::publisher::Publisher;
use crate::recovery::{Recovery, SessionRegistry};
use crate::rpc::RpcCoordinator;

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct DeliveryItem {
    packet: Packet,
    opts: BroadcastOptions,
    offset: Option<Offset>,
}

/// Distributed event-broadcast adapter for one namespace.
pub struct Adapter {
    weak: Weak<Adapter>,
    uid: InstanceId,
    nsp: String,
    config: AdapterConfig,
    host: Arc<dyn SocketHost>,
    publisher: Arc<Publisher>,
    coordinator: Arc<RpcCoordinator>,
    registry: Arc<SessionRegistry>,
    delivery: Arc<LocalDelivery>,
    recovery: Recovery,
    events: broadcast::Sender<AdapterEvent>,
    shutdown: CancellationToken,
    store: Arc<dyn EventLog<Value>>,
    delivery_tx: mpsc::UnboundedSender<DeliveryItem>,
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryItem>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Adapter {
    /// Wire an adapter over the shared stream for one namespace. Call
    /// [`Adapter::init`] to start the listener and heartbeat tasks.
    pub fn new(
        store: Arc<dyn EventLog<Value>>,
        host: Arc<dyn SocketHost>,
        nsp: impl Into<String>,
        config: AdapterConfig,
    ) -> Arc<Self> {
        let nsp = nsp.into();
        let uid = config.uid.unwrap_or_else(Uuid::new_v4);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let publisher = Arc::new(Publisher::new(
            store.clone(),
            uid,
            nsp.clone(),
            config.publish_attempts,
            config.add_created_at_field,
        ));
        let registry = Arc::new(SessionRegistry::new());
        let delivery = Arc::new(LocalDelivery::new(host.clone(), registry.clone()));
        let coordinator = Arc::new(RpcCoordinator::new(events.clone()));
        let recovery = Recovery::new(
            store.clone(),
            host.clone(),
            registry.clone(),
            publisher.clone(),
            nsp.clone(),
            config.max_disconnection_duration,
            config.persist_sessions,
        );

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            uid,
            nsp,
            config,
            host,
            publisher,
            coordinator,
            registry,
            delivery,
            recovery,
            events,
            shutdown: CancellationToken::new(),
            store,
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the stream listener, the ordered delivery lane and the
    /// heartbeat task, then announce this instance to its peers.
    pub async fn init(&self) -> Result<()> {
        let delivery_rx = self.delivery_rx.lock().unwrap().take();
        let Some(mut delivery_rx) = delivery_rx else {
            return Ok(()); // already initialized
        };

        // Ordered delivery lane: broadcasts are applied one at a time, in
        // the order they were dispatched, so per-session ordering holds.
        let delivery = self.delivery.clone();
        let shutdown = self.shutdown.clone();
        let delivery_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = delivery_rx.recv() => match item {
                        Some(item) => {
                            delivery.deliver(&item.packet, &item.opts, item.offset).await;
                        }
                        None => break,
                    }
                }
            }
        });

        let weak = self.weak.clone();
        let handler: RecordHandler = Arc::new(move |offset, record| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(adapter) = weak.upgrade() {
                    adapter.dispatch(offset, record).await;
                }
            })
        });
        let listener_task = spawn_listener(
            self.store.clone(),
            self.uid,
            self.config.overlap_margin,
            self.config.dedup_capacity,
            self.shutdown.clone(),
            self.events.clone(),
            handler,
        );

        let heartbeat_task = self.spawn_heartbeat();

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(delivery_task);
            tasks.push(listener_task);
            tasks.push(heartbeat_task);
        }

        // Announce ourselves; peers answer an initial heartbeat right
        // away, so cluster size converges before the first request.
        self.publisher
            .publish(RecordPayload::Request(RequestFrame {
                request_id: Uuid::new_v4(),
                op: RequestOp::Heartbeat { initial: true },
            }))
            .await?;

        info!(uid = %self.uid, nsp = %self.nsp, "adapter initialized");
        Ok(())
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(adapter) = weak.upgrade() else { break };
                        if let Err(err) = adapter
                            .publisher
                            .publish(RecordPayload::Request(RequestFrame {
                                request_id: Uuid::new_v4(),
                                op: RequestOp::Heartbeat { initial: false },
                            }))
                            .await
                        {
                            warn!(error = %err, "heartbeat publish failed");
                        }
                        adapter.coordinator.sweep_peers(adapter.config.heartbeat_timeout);
                        adapter
                            .registry
                            .sweep(Utc::now(), adapter.config.max_disconnection_duration);
                    }
                }
            }
        })
    }

    /// Stop the listener and background tasks. The in-flight record
    /// finishes dispatching; no new record is read.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "adapter task panicked");
            }
        }
        info!(uid = %self.uid, "adapter closed");
    }

    /// This instance's id.
    pub fn uid(&self) -> InstanceId {
        self.uid
    }

    /// The namespace this adapter serves.
    pub fn nsp(&self) -> &str {
        &self.nsp
    }

    /// Subscribe to diagnostic events (publish failures, operation
    /// timeouts, peers going down, stream loss).
    pub fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    /// Number of instances currently serving this namespace, this one
    /// included.
    pub fn server_count(&self) -> usize {
        1 + self.coordinator.alive_peers(self.config.heartbeat_timeout)
    }

    // ---- broadcast ----------------------------------------------------

    /// Fan a packet out to every matching socket on every instance.
    ///
    /// Local delivery is attempted even when the insert fails; the error
    /// then reports that remote fan-out did not happen.
    pub async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<()> {
        if opts.flags.local {
            self.enqueue_local(packet, opts, None);
            return Ok(());
        }

        match self
            .publisher
            .publish(RecordPayload::Broadcast {
                packet: packet.clone(),
                opts: opts.clone(),
            })
            .await
        {
            Ok(offset) => {
                self.enqueue_local(packet, opts, Some(offset));
                Ok(())
            }
            Err(err) => {
                if matches!(err, AdapterError::PublishFailed { .. }) {
                    let _ = self.events.send(AdapterEvent::PublishFailed { kind: "broadcast" });
                }
                self.enqueue_local(packet, opts, None);
                Err(err)
            }
        }
    }

    /// Broadcast a packet and aggregate the client acks from every
    /// instance. Resolves with the acks collected when the deadline hits.
    pub async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<Vec<Value>> {
        let request_id = Uuid::new_v4();
        let expected = self.coordinator.alive_peers(self.config.heartbeat_timeout);
        let rx = self.coordinator.register(request_id, expected);

        if let Err(err) = self
            .publisher
            .publish(RecordPayload::Request(RequestFrame {
                request_id,
                op: RequestOp::BroadcastWithAck {
                    packet: packet.clone(),
                    opts: opts.clone(),
                },
            }))
            .await
        {
            self.coordinator.discard(request_id);
            return Err(err);
        }

        let mut acks = self.delivery.deliver_with_ack(&packet, &opts).await;
        for aggregate in self.await_responses(request_id, rx).await {
            match aggregate {
                Value::Array(items) => acks.extend(items),
                other => acks.push(other),
            }
        }
        Ok(acks)
    }

    // ---- cluster queries ----------------------------------------------

    /// Socket ids in any of the given rooms, across the cluster. An empty
    /// filter means every socket in the namespace.
    pub async fn sockets(&self, rooms: BTreeSet<String>) -> Result<BTreeSet<SocketId>> {
        let opts = BroadcastOptions {
            rooms,
            ..BroadcastOptions::default()
        };
        let mut set = self.delivery.targets(&opts);
        for response in self.request(RequestOp::Sockets { opts }).await? {
            match serde_json::from_value::<Vec<SocketId>>(response) {
                Ok(sids) => set.extend(sids),
                Err(err) => warn!(error = %err, "unparseable sockets response dropped"),
            }
        }
        Ok(set)
    }

    /// Room names across the cluster.
    pub async fn all_rooms(&self) -> Result<BTreeSet<String>> {
        let mut rooms = self.host.rooms();
        for response in self.request(RequestOp::AllRooms).await? {
            match serde_json::from_value::<Vec<String>>(response) {
                Ok(names) => rooms.extend(names),
                Err(err) => warn!(error = %err, "unparseable rooms response dropped"),
            }
        }
        Ok(rooms)
    }

    /// Serialized views of the sockets matching a filter, across the
    /// cluster unless the filter is flagged local.
    pub async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<SocketView>> {
        let mut views = self.host.fetch(&opts);
        if opts.flags.local {
            return Ok(views);
        }
        for response in self.request(RequestOp::RemoteFetch { opts }).await? {
            match serde_json::from_value::<Vec<SocketView>>(response) {
                Ok(remote) => views.extend(remote),
                Err(err) => warn!(error = %err, "unparseable fetch response dropped"),
            }
        }
        Ok(views)
    }

    // ---- targeted operations ------------------------------------------

    /// Join a socket to rooms, wherever in the cluster it lives.
    pub async fn remote_join(&self, sid: SocketId, rooms: BTreeSet<String>) -> Result<()> {
        if self.host.socket_rooms(&sid).is_some() {
            self.host.add_all(&sid, &rooms);
            return Ok(());
        }
        let responses = self
            .request(RequestOp::RemoteJoin {
                sid: sid.clone(),
                rooms,
            })
            .await?;
        if any_applied(&responses) {
            Ok(())
        } else {
            Err(AdapterError::SocketNotFound(sid))
        }
    }

    /// Remove a socket from a room, wherever in the cluster it lives.
    pub async fn remote_leave(&self, sid: SocketId, room: String) -> Result<()> {
        if self.host.socket_rooms(&sid).is_some() {
            self.host.del(&sid, &room);
            return Ok(());
        }
        let responses = self
            .request(RequestOp::RemoteLeave {
                sid: sid.clone(),
                room,
            })
            .await?;
        if any_applied(&responses) {
            Ok(())
        } else {
            Err(AdapterError::SocketNotFound(sid))
        }
    }

    /// Disconnect a socket, wherever in the cluster it lives.
    pub async fn remote_disconnect(&self, sid: SocketId, close: bool) -> Result<()> {
        if self.host.socket_rooms(&sid).is_some() {
            self.host.disconnect(&sid, close)?;
            return Ok(());
        }
        let responses = self
            .request(RequestOp::RemoteDisconnect {
                sid: sid.clone(),
                close,
            })
            .await?;
        if any_applied(&responses) {
            Ok(())
        } else {
            Err(AdapterError::SocketNotFound(sid))
        }
    }

    // ---- server-side emit ---------------------------------------------

    /// Hand arguments to the namespace-level listeners of every other
    /// instance. Fire and forget.
    pub async fn server_side_emit(&self, args: Vec<Value>) -> Result<()> {
        self.publisher
            .publish(RecordPayload::ServerSideEmit { args })
            .await?;
        Ok(())
    }

    /// Hand arguments to the namespace-level listeners of every other
    /// instance and collect their replies.
    pub async fn server_side_emit_with_ack(&self, args: Vec<Value>) -> Result<Vec<Value>> {
        self.request(RequestOp::ServerSideEmit { args }).await
    }

    // ---- session recovery ---------------------------------------------

    /// Start tracking a connection for recovery. The returned session's
    /// `pid` and `last_offset` go into the client's init payload.
    pub async fn create_session(&self, sid: SocketId) -> Result<Session> {
        self.recovery.create_session(sid).await
    }

    /// Keep an abruptly disconnected session recoverable for the grace
    /// window. Call before the host tears down the socket's membership.
    pub async fn persist_session(&self, sid: &SocketId) -> Result<()> {
        self.recovery.persist_session(sid).await
    }

    /// Restore a session from the `(pid, lastOffset)` pair presented by a
    /// reconnecting client. Rooms are re-joined and missed broadcasts
    /// replayed in order before this returns.
    pub async fn restore_session(&self, pid: PrivateId, offset: &str) -> Result<Session> {
        self.recovery.restore_session(pid, offset).await
    }

    /// Destroy a session on clean disconnect.
    pub fn forget_session(&self, sid: &SocketId) {
        self.recovery.forget_session(sid);
    }

    // ---- internals ----------------------------------------------------

    fn enqueue_local(&self, packet: Packet, opts: BroadcastOptions, offset: Option<Offset>) {
        let _ = self.delivery_tx.send(DeliveryItem {
            packet,
            opts,
            offset,
        });
    }

    async fn request(&self, op: RequestOp) -> Result<Vec<Value>> {
        let request_id = Uuid::new_v4();
        let expected = self.coordinator.alive_peers(self.config.heartbeat_timeout);
        let rx = self.coordinator.register(request_id, expected);

        if let Err(err) = self
            .publisher
            .publish(RecordPayload::Request(RequestFrame { request_id, op }))
            .await
        {
            self.coordinator.discard(request_id);
            return Err(err);
        }
        Ok(self.await_responses(request_id, rx).await)
    }

    async fn await_responses(
        &self,
        request_id: RequestId,
        rx: tokio::sync::oneshot::Receiver<Vec<Value>>,
    ) -> Vec<Value> {
        match tokio::time::timeout(self.config.requests_timeout, rx).await {
            Ok(Ok(values)) => values,
            Ok(Err(_)) => Vec::new(),
            Err(_) => self.coordinator.timed_out(request_id),
        }
    }

    /// Per-record dispatch, invoked by the listener in offset order.
    /// Hands work off and returns; it never runs delivery or request
    /// handling inline.
    async fn dispatch(self: Arc<Self>, offset: Offset, record: Record) {
        if record.nsp != self.nsp {
            trace!(nsp = %record.nsp, "record for another namespace skipped");
            return;
        }
        let from = record.uid;
        match record.payload {
            RecordPayload::Broadcast { packet, opts } => {
                self.enqueue_local(packet, opts, Some(offset));
            }
            RecordPayload::Request(frame) => {
                let adapter = self.clone();
                tokio::spawn(async move {
                    adapter.handle_request(frame, from).await;
                });
            }
            RecordPayload::Response(frame) | RecordPayload::Ack(frame) => {
                self.coordinator.on_response(frame.request_id, frame.data);
            }
            RecordPayload::ServerSideEmit { args } => {
                let host = self.host.clone();
                tokio::spawn(async move {
                    host.server_side_emit(args).await;
                });
            }
            // Session rows are data at rest; lookups go through the store.
            RecordPayload::Session(_) => {}
        }
    }

    async fn handle_request(&self, frame: RequestFrame, from: InstanceId) {
        let request_id = frame.request_id;
        debug!(%request_id, %from, "handling request");
        let data = match frame.op {
            RequestOp::Heartbeat { initial } => {
                self.coordinator.observe_heartbeat(from);
                if initial {
                    let reply = RecordPayload::Request(RequestFrame {
                        request_id: Uuid::new_v4(),
                        op: RequestOp::Heartbeat { initial: false },
                    });
                    if let Err(err) = self.publisher.publish(reply).await {
                        warn!(error = %err, "heartbeat reply failed");
                    }
                }
                return;
            }
            RequestOp::Sockets { opts } => {
                let sids: Vec<SocketId> = self.delivery.targets(&opts).into_iter().collect();
                serde_json::to_value(sids).unwrap_or(Value::Null)
            }
            RequestOp::AllRooms => {
                let rooms: Vec<String> = self.host.rooms().into_iter().collect();
                serde_json::to_value(rooms).unwrap_or(Value::Null)
            }
            RequestOp::RemoteJoin { sid, rooms } => {
                let applied = self.host.socket_rooms(&sid).is_some();
                if applied {
                    self.host.add_all(&sid, &rooms);
                }
                serde_json::json!({ "applied": applied })
            }
            RequestOp::RemoteLeave { sid, room } => {
                let applied = self.host.socket_rooms(&sid).is_some();
                if applied {
                    self.host.del(&sid, &room);
                }
                serde_json::json!({ "applied": applied })
            }
            RequestOp::RemoteDisconnect { sid, close } => {
                let applied =
                    self.host.socket_rooms(&sid).is_some() && self.host.disconnect(&sid, close).is_ok();
                serde_json::json!({ "applied": applied })
            }
            RequestOp::RemoteFetch { opts } => {
                serde_json::to_value(self.host.fetch(&opts)).unwrap_or(Value::Null)
            }
            RequestOp::ServerSideEmit { args } => self
                .host
                .server_side_emit(args)
                .await
                .unwrap_or(Value::Null),
            RequestOp::BroadcastWithAck { packet, opts } => {
                let acks = self.delivery.deliver_with_ack(&packet, &opts).await;
                let payload = RecordPayload::Ack(ResponseFrame {
                    request_id,
                    data: Value::Array(acks),
                });
                if let Err(err) = self.publisher.publish(payload).await {
                    warn!(%request_id, error = %err, "ack publish failed");
                }
                return;
            }
        };

        let payload = RecordPayload::Response(ResponseFrame { request_id, data });
        if let Err(err) = self.publisher.publish(payload).await {
            warn!(%request_id, error = %err, "response publish failed");
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        // Stops the listener even when the adapter is dropped without a
        // close() call.
        self.shutdown.cancel();
    }
}

fn any_applied(responses: &[Value]) -> bool {
    responses
        .iter()
        .any(|value| value.get("applied").and_then(Value::as_bool).unwrap_or(false))
}
