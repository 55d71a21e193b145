//! Resumable stream listener.
//!
//! One task per adapter tails the shared stream and dispatches records in
//! strict offset order. The handler is awaited per record but must only
//! hand work off (enqueue a delivery, spawn a request handler); it never
//! runs the downstream work inline.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use fanout_core::{InstanceId, Record};
use fanout_stream::{EventLog, Offset, StoreError, TailPosition};

use crate::error::AdapterEvent;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Async handler invoked for every foreign record, in offset order.
pub(crate) type RecordHandler =
    Arc<dyn Fn(Offset, Record) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Bounded window of recently-seen offsets.
///
/// The listener starts a few records before the stream tail to paper over
/// store-side ordering skew, and re-reads the resume record after cursor
/// errors; this window turns both into no-ops.
pub(crate) struct DedupWindow {
    seen: HashSet<Offset>,
    order: VecDeque<Offset>,
    capacity: usize,
}

impl DedupWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an offset. Returns `false` when it was already present.
    pub(crate) fn insert(&mut self, offset: Offset) -> bool {
        if !self.seen.insert(offset) {
            return false;
        }
        self.order.push_back(offset);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Spawn the tailing task.
///
/// The task only stops on cancellation or a terminal store error; the
/// in-flight record finishes dispatching, then no new record is read.
pub(crate) fn spawn_listener(
    store: Arc<dyn EventLog<Value>>,
    uid: InstanceId,
    overlap_margin: u64,
    dedup_capacity: usize,
    shutdown: CancellationToken,
    events: broadcast::Sender<AdapterEvent>,
    handler: RecordHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(
            store,
            uid,
            overlap_margin,
            dedup_capacity,
            shutdown,
            events,
            handler,
        )
        .await;
    })
}

async fn run(
    store: Arc<dyn EventLog<Value>>,
    uid: InstanceId,
    overlap_margin: u64,
    dedup_capacity: usize,
    shutdown: CancellationToken,
    events: broadcast::Sender<AdapterEvent>,
    handler: RecordHandler,
) {
    let mut dedup = DedupWindow::new(dedup_capacity);
    let mut backoff = BACKOFF_BASE;

    // Starting position: the current tail minus the overlap margin.
    let mut resume: Option<Offset> = loop {
        match store.latest().await {
            Ok(latest) => break latest.map(|offset| offset.back(overlap_margin)),
            Err(StoreError::Gone(reason)) => {
                stream_gone(&events, reason);
                return;
            }
            Err(err) => {
                warn!(error = %err, "stream tail position unavailable");
                if pause(&shutdown, &mut backoff).await {
                    return;
                }
            }
        }
    };

    info!(%uid, start = ?resume, "stream listener started");

    'reopen: loop {
        let position = match resume {
            Some(offset) => TailPosition::After(offset),
            None => TailPosition::Oldest,
        };
        let mut cursor = match store.tail(position).await {
            Ok(cursor) => cursor,
            Err(StoreError::Gone(reason)) => {
                stream_gone(&events, reason);
                return;
            }
            Err(err) => {
                warn!(error = %err, "cursor open failed");
                if pause(&shutdown, &mut backoff).await {
                    return;
                }
                continue 'reopen;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(%uid, "stream listener stopped");
                    return;
                }
                next = cursor.next() => match next {
                    Ok((offset, document)) => {
                        backoff = BACKOFF_BASE;
                        resume = Some(offset);
                        if !dedup.insert(offset) {
                            trace!(%offset, "duplicate record skipped");
                            continue;
                        }
                        let record = match Record::decode(document) {
                            Ok(record) => record,
                            Err(err) => {
                                warn!(%offset, error = %err, "malformed record dropped");
                                continue;
                            }
                        };
                        if record.uid == uid {
                            trace!(%offset, "own record skipped");
                            continue;
                        }
                        debug!(%offset, "dispatching record");
                        handler(offset, record).await;
                    }
                    Err(StoreError::Unavailable(err)) => {
                        warn!(error = %err, resume = ?resume, "cursor failed, reopening");
                        if pause(&shutdown, &mut backoff).await {
                            return;
                        }
                        continue 'reopen;
                    }
                    Err(StoreError::Gone(reason)) => {
                        stream_gone(&events, reason);
                        return;
                    }
                }
            }
        }
    }
}

/// Back off before a retry. Returns `true` when shutdown was requested.
async fn pause(shutdown: &CancellationToken, backoff: &mut Duration) -> bool {
    let wait = *backoff;
    *backoff = (*backoff * 2).min(BACKOFF_MAX);
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(wait) => false,
    }
}

fn stream_gone(events: &broadcast::Sender<AdapterEvent>, reason: String) {
    error!(reason = %reason, "stream gone, listener exiting");
    let _ = events.send(AdapterEvent::StreamGone { reason });
}
