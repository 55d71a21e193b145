//! Capped in-memory EventLog implementation.
//!
//! Behaves like a capped collection: rows past `capacity` are evicted oldest
//! first, offsets are monotone across writers, and tail cursors wake when
//! new rows arrive. Failure injection (`fail_appends`, `close`) exercises
//! the transient and terminal store error paths without a real backend.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::traits::{EventCursor, EventLog, Offset, TailPosition};

/// Capped in-memory implementation of [`EventLog`].
pub struct CappedMemoryLog<E> {
    shared: Arc<Shared<E>>,
}

struct Shared<E> {
    state: Mutex<State<E>>,
    notify: Notify,
}

struct State<E> {
    rows: VecDeque<(Offset, E)>,
    next_offset: u64,
    capacity: usize,
    append_failures: u32,
    closed: bool,
}

impl<E> CappedMemoryLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create a capped log retaining at most `capacity` rows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    rows: VecDeque::new(),
                    next_offset: 1,
                    capacity,
                    append_failures: 0,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Number of retained rows.
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.rows.len()
    }

    /// Whether the log retains no rows.
    pub async fn is_empty(&self) -> bool {
        self.shared.state.lock().await.rows.is_empty()
    }

    /// Make the next `n` appends fail with [`StoreError::Unavailable`].
    pub async fn fail_appends(&self, n: u32) {
        self.shared.state.lock().await.append_failures = n;
    }

    /// Close the log: appends and cursors fail with [`StoreError::Gone`]
    /// from this point on.
    pub async fn close(&self) {
        self.shared.state.lock().await.closed = true;
        self.shared.notify.notify_waiters();
    }
}

impl<E> Clone for CappedMemoryLog<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl<E> EventLog<E> for CappedMemoryLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn append(&self, event: &E) -> Result<Offset> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(StoreError::Gone("log closed".into()));
        }
        if state.append_failures > 0 {
            state.append_failures -= 1;
            return Err(StoreError::Unavailable("injected append failure".into()));
        }

        let offset = Offset(state.next_offset);
        state.next_offset += 1;
        state.rows.push_back((offset, event.clone()));
        while state.rows.len() > state.capacity {
            let evicted = state.rows.pop_front();
            if let Some((old, _)) = evicted {
                debug!(offset = %old, "evicted capped row");
            }
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(offset)
    }

    async fn oldest(&self) -> Result<Option<Offset>> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(StoreError::Gone("log closed".into()));
        }
        Ok(state.rows.front().map(|(o, _)| *o))
    }

    async fn latest(&self) -> Result<Option<Offset>> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(StoreError::Gone("log closed".into()));
        }
        Ok(state.rows.back().map(|(o, _)| *o))
    }

    async fn after(&self, offset: Offset) -> Result<Vec<(Offset, E)>> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(StoreError::Gone("log closed".into()));
        }
        Ok(state
            .rows
            .iter()
            .filter(|(o, _)| *o > offset)
            .cloned()
            .collect())
    }

    async fn rfind(&self, pred: &(dyn for<'a> Fn(&'a E) -> bool + Sync)) -> Result<Option<(Offset, E)>> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(StoreError::Gone("log closed".into()));
        }
        for (offset, event) in state.rows.iter().rev() {
            if pred(event) {
                return Ok(Some((*offset, event.clone())));
            }
        }
        Ok(None)
    }

    async fn tail(&self, position: TailPosition) -> Result<Box<dyn EventCursor<E>>> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(StoreError::Gone("log closed".into()));
        }
        let last = match position {
            TailPosition::Oldest => None,
            TailPosition::After(offset) => Some(offset),
            TailPosition::Latest => state.rows.back().map(|(o, _)| *o),
        };
        drop(state);

        Ok(Box::new(MemoryCursor {
            shared: Arc::clone(&self.shared),
            last,
        }))
    }
}

/// Tail cursor over a [`CappedMemoryLog`].
struct MemoryCursor<E> {
    shared: Arc<Shared<E>>,
    last: Option<Offset>,
}

#[async_trait]
impl<E> EventCursor<E> for MemoryCursor<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn next(&mut self) -> Result<(Offset, E)> {
        loop {
            // Register for wakeup before inspecting state, otherwise an
            // append between the check and the await is lost.
            let notified = self.shared.notify.notified();
            {
                let state = self.shared.state.lock().await;
                if state.closed {
                    return Err(StoreError::Gone("log closed".into()));
                }
                let found = state
                    .rows
                    .iter()
                    .find(|(o, _)| self.last.is_none_or(|last| *o > last))
                    .cloned();
                if let Some((offset, event)) = found {
                    self.last = Some(offset);
                    return Ok((offset, event));
                }
            }
            notified.await;
        }
    }

    fn position(&self) -> Option<Offset> {
        self.last
    }
}
