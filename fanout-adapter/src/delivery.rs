//! Local packet delivery.
//!
//! Applies a broadcast to the sockets of this instance: resolve candidates
//! from the room filter, drop excluded sockets, hand the packet to each
//! transport. Per-socket failures are logged and skipped; they never abort
//! delivery to the remaining sockets.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use fanout_core::{BroadcastOptions, Packet, SocketHost, SocketId};
use fanout_stream::Offset;

use crate::recovery::SessionRegistry;

pub(crate) struct LocalDelivery {
    host: Arc<dyn SocketHost>,
    registry: Arc<SessionRegistry>,
}

impl LocalDelivery {
    pub(crate) fn new(host: Arc<dyn SocketHost>, registry: Arc<SessionRegistry>) -> Self {
        Self { host, registry }
    }

    /// Sockets targeted by the given options on this instance.
    pub(crate) fn targets(&self, opts: &BroadcastOptions) -> BTreeSet<SocketId> {
        let candidates = self.host.sockets(&opts.rooms);
        if opts.except.is_empty() {
            return candidates;
        }
        let excluded = self.host.sockets(&opts.except);
        candidates.difference(&excluded).cloned().collect()
    }

    /// Deliver a packet to every matching socket. When `offset` is given,
    /// each successful transmission advances that socket's session offset.
    /// Returns the number of sockets reached.
    pub(crate) async fn deliver(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        offset: Option<Offset>,
    ) -> usize {
        let targets = self.targets(opts);
        let mut delivered = 0usize;
        for sid in &targets {
            match self.host.send(sid, packet, &opts.flags).await {
                Ok(()) => {
                    delivered += 1;
                    if let Some(offset) = offset {
                        self.registry.advance(sid, offset);
                    }
                }
                Err(err) => {
                    warn!(%sid, error = %err, "packet delivery failed");
                }
            }
        }
        debug!(delivered, total = targets.len(), "broadcast applied");
        delivered
    }

    /// Deliver a packet to every matching socket and collect the client
    /// acks. Failed sockets contribute nothing.
    pub(crate) async fn deliver_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
    ) -> Vec<Value> {
        let targets = self.targets(opts);
        let sends = targets
            .iter()
            .map(|sid| self.host.send_with_ack(sid, packet, &opts.flags));
        join_all(sends)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(ack) => Some(ack),
                Err(err) => {
                    warn!(error = %err, "ack delivery failed");
                    None
                }
            })
            .collect()
    }
}
