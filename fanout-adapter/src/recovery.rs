//! Session registry and connection-state recovery.
//!
//! Live sessions are tracked per instance; abruptly disconnected ones stay
//! recoverable until the grace window elapses. With persistence enabled a
//! session row is also appended to the stream, so a reconnect landing on a
//! different instance (or a restarted one) can still claim the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use fanout_core::{
    PrivateId, Record, RecordPayload, Session, SessionState, SocketHost, SocketId,
};
use fanout_stream::{EventLog, Offset, StoreError};

use crate::error::{AdapterError, Result};
use crate::publisher::Publisher;

/// Per-instance session table: one owning map keyed by sid, with a pid
/// index derived from it.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    by_sid: HashMap<SocketId, Session>,
    by_pid: HashMap<PrivateId, SocketId>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a fresh live session for a connection.
    pub(crate) fn create(&self, sid: SocketId, nsp: &str, offset: Offset) -> Session {
        let session = Session::new(sid.clone(), nsp, offset);
        let mut state = self.state.lock().unwrap();
        if let Some(stale) = state.by_sid.insert(sid.clone(), session.clone()) {
            state.by_pid.remove(&stale.pid);
        }
        state.by_pid.insert(session.pid, sid);
        session
    }

    /// Advance a live session's offset after a successful transmission.
    /// No-op for sockets without a session.
    pub(crate) fn advance(&self, sid: &SocketId, offset: Offset) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.by_sid.get_mut(sid)
            && session.state == SessionState::Live
        {
            session.advance(offset);
        }
    }

    pub(crate) fn get(&self, sid: &SocketId) -> Option<Session> {
        self.state.lock().unwrap().by_sid.get(sid).cloned()
    }

    /// Move a session into its grace window, snapshotting room membership.
    pub(crate) fn suspend(
        &self,
        sid: &SocketId,
        rooms: std::collections::BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        let mut state = self.state.lock().unwrap();
        let session = state.by_sid.get_mut(sid)?;
        session.suspend(rooms, now);
        Some(session.clone())
    }

    /// Drop a session entirely (clean disconnect).
    pub(crate) fn forget(&self, sid: &SocketId) -> Option<Session> {
        let mut state = self.state.lock().unwrap();
        let session = state.by_sid.remove(sid)?;
        state.by_pid.remove(&session.pid);
        Some(session)
    }

    /// A recoverable session by its private id, if any.
    pub(crate) fn find_recoverable(&self, pid: &PrivateId) -> Option<Session> {
        let state = self.state.lock().unwrap();
        let sid = state.by_pid.get(pid)?;
        state
            .by_sid
            .get(sid)
            .filter(|session| session.state == SessionState::Recoverable)
            .cloned()
    }

    /// Put a session back, replacing any entry under the same sid.
    pub(crate) fn put(&self, session: Session) {
        let mut state = self.state.lock().unwrap();
        if let Some(stale) = state.by_sid.insert(session.sid.clone(), session.clone())
            && stale.pid != session.pid
        {
            state.by_pid.remove(&stale.pid);
        }
        state.by_pid.insert(session.pid, session.sid);
    }

    /// Drop sessions whose grace window has elapsed.
    pub(crate) fn sweep(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Session> {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<SocketId> = state
            .by_sid
            .values()
            .filter(|session| session.expired(now, grace))
            .map(|session| session.sid.clone())
            .collect();
        expired
            .iter()
            .filter_map(|sid| {
                let session = state.by_sid.remove(sid)?;
                state.by_pid.remove(&session.pid);
                Some(session)
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().by_sid.len()
    }
}

/// Connection-state recovery over the shared stream.
pub(crate) struct Recovery {
    store: Arc<dyn EventLog<Value>>,
    host: Arc<dyn SocketHost>,
    registry: Arc<SessionRegistry>,
    publisher: Arc<Publisher>,
    nsp: String,
    grace: Duration,
    persist: bool,
}

impl Recovery {
    pub(crate) fn new(
        store: Arc<dyn EventLog<Value>>,
        host: Arc<dyn SocketHost>,
        registry: Arc<SessionRegistry>,
        publisher: Arc<Publisher>,
        nsp: String,
        grace: Duration,
        persist: bool,
    ) -> Self {
        Self {
            store,
            host,
            registry,
            publisher,
            nsp,
            grace,
            persist,
        }
    }

    /// Start tracking a connection. Returns the session whose `pid` and
    /// `last_offset` go into the client's init payload.
    pub(crate) async fn create_session(&self, sid: SocketId) -> Result<Session> {
        let latest = self
            .store
            .latest()
            .await
            .map_err(map_store_err)?
            .unwrap_or(Offset::ZERO);
        Ok(self.registry.create(sid, &self.nsp, latest))
    }

    /// Abrupt disconnect: keep the session recoverable for the grace
    /// window. Must be called before the host tears down the socket's
    /// room membership.
    pub(crate) async fn persist_session(&self, sid: &SocketId) -> Result<()> {
        let rooms = self
            .host
            .socket_rooms(sid)
            .or_else(|| self.registry.get(sid).map(|session| session.rooms))
            .unwrap_or_default();
        let session = self
            .registry
            .suspend(sid, rooms, Utc::now())
            .ok_or(AdapterError::SessionUnknown)?;
        debug!(%sid, pid = %session.pid, "session suspended");

        if self.persist
            && let Some(row) = session.to_row()
        {
            if let Err(err) = self.publisher.publish(RecordPayload::Session(row)).await {
                warn!(%sid, error = %err, "session row publish failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clean disconnect: destroy the session.
    pub(crate) fn forget_session(&self, sid: &SocketId) {
        if self.registry.forget(sid).is_some() {
            debug!(%sid, "session forgotten");
        }
    }

    /// Restore a session from `(pid, lastOffset)` presented by a
    /// reconnecting client: re-join its rooms, replay missed broadcasts in
    /// offset order, mark it live again.
    pub(crate) async fn restore_session(&self, pid: PrivateId, offset: &str) -> Result<Session> {
        let offset: Offset = offset
            .parse()
            .map_err(|_| AdapterError::OffsetInvalid(offset.to_string()))?;

        let mut session = match self.registry.find_recoverable(&pid) {
            Some(session) => session,
            None => self
                .lookup_persisted(&pid)
                .await?
                .ok_or(AdapterError::SessionUnknown)?,
        };

        let now = Utc::now();
        if session.expired(now, self.grace) {
            self.registry.forget(&session.sid);
            return Err(AdapterError::SessionUnknown);
        }

        // An offset older than the oldest retained record means part of
        // the missed window has been capped away; the replay would be
        // silently incomplete.
        if let Some(oldest) = self.store.oldest().await.map_err(map_store_err)?
            && offset < oldest
        {
            return Err(AdapterError::OffsetInvalid(offset.to_string()));
        }

        session.advance(offset);

        // Re-join before replay so replayed packets land against the
        // session's membership.
        self.host.add_all(&session.sid, &session.rooms);

        let rows = self.store.after(offset).await.map_err(map_store_err)?;
        let mut replayed = 0usize;
        for (row_offset, document) in rows {
            let record = match Record::decode(document) {
                Ok(record) => record,
                Err(err) => {
                    warn!(offset = %row_offset, error = %err, "malformed record skipped in replay");
                    continue;
                }
            };
            if record.nsp != self.nsp {
                continue;
            }
            let RecordPayload::Broadcast { packet, opts } = record.payload else {
                continue;
            };
            if opts.flags.volatile || !opts.matches(&session.rooms) {
                continue;
            }
            match self.host.send(&session.sid, &packet, &opts.flags).await {
                Ok(()) => {
                    session.advance(row_offset);
                    replayed += 1;
                }
                Err(err) => {
                    // Keep the progress made: a later reconnect resumes
                    // from the last delivered packet.
                    warn!(sid = %session.sid, error = %err, "replay interrupted");
                    self.registry.put(session);
                    return Err(err.into());
                }
            }
        }

        session.resume();
        self.registry.put(session.clone());
        info!(sid = %session.sid, pid = %pid, replayed, "session restored");
        Ok(session)
    }

    /// Most recent session row for `pid`, when persistence is enabled.
    async fn lookup_persisted(&self, pid: &PrivateId) -> Result<Option<Session>> {
        if !self.persist {
            return Ok(None);
        }
        let pid_text = pid.to_string();
        let nsp = self.nsp.clone();
        let pred = move |doc: &Value| {
            doc.get("type").and_then(Value::as_str) == Some("session")
                && doc.get("nsp").and_then(Value::as_str) == Some(nsp.as_str())
                && doc
                    .get("data")
                    .and_then(|data| data.get("pid"))
                    .and_then(Value::as_str)
                    == Some(pid_text.as_str())
        };
        let found = self.store.rfind(&pred).await.map_err(map_store_err)?;
        let Some((_, document)) = found else {
            return Ok(None);
        };
        let record = Record::decode(document)?;
        match record.payload {
            RecordPayload::Session(row) => Ok(Some(Session::from_row(row, &self.nsp))),
            _ => Ok(None),
        }
    }
}

fn map_store_err(err: StoreError) -> AdapterError {
    match err {
        StoreError::Gone(reason) => AdapterError::StreamGone(reason),
        err => AdapterError::StoreUnavailable(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn rooms(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn registry_create_indexes_by_pid() {
        let registry = SessionRegistry::new();
        let session = registry.create(SocketId::from("s1"), "/", Offset(1));

        assert_eq!(registry.get(&SocketId::from("s1")), Some(session.clone()));
        // Not recoverable while live.
        assert_eq!(registry.find_recoverable(&session.pid), None);
    }

    #[test]
    fn registry_advance_only_touches_live_sessions() {
        let registry = SessionRegistry::new();
        let sid = SocketId::from("s1");
        registry.create(sid.clone(), "/", Offset(1));

        registry.advance(&sid, Offset(4));
        assert_eq!(registry.get(&sid).unwrap().last_offset, Offset(4));

        registry.suspend(&sid, rooms(&[]), Utc::now());
        registry.advance(&sid, Offset(9));
        assert_eq!(registry.get(&sid).unwrap().last_offset, Offset(4));
    }

    #[test]
    fn registry_suspend_makes_session_claimable() {
        let registry = SessionRegistry::new();
        let sid = SocketId::from("s1");
        let session = registry.create(sid.clone(), "/", Offset(1));

        registry.suspend(&sid, rooms(&["room1"]), Utc::now());
        let found = registry.find_recoverable(&session.pid).unwrap();
        assert_eq!(found.rooms, rooms(&["room1"]));
        assert_eq!(found.state, SessionState::Recoverable);
    }

    #[test]
    fn registry_forget_clears_both_indices() {
        let registry = SessionRegistry::new();
        let sid = SocketId::from("s1");
        let session = registry.create(sid.clone(), "/", Offset(1));
        registry.suspend(&sid, rooms(&[]), Utc::now());

        registry.forget(&sid);
        assert_eq!(registry.get(&sid), None);
        assert_eq!(registry.find_recoverable(&session.pid), None);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn registry_sweep_drops_expired_sessions_only() {
        let registry = SessionRegistry::new();
        let old = SocketId::from("old");
        let fresh = SocketId::from("fresh");
        registry.create(old.clone(), "/", Offset(1));
        registry.create(fresh.clone(), "/", Offset(1));

        let long_ago = Utc::now() - chrono::TimeDelta::seconds(600);
        registry.suspend(&old, rooms(&[]), long_ago);
        registry.suspend(&fresh, rooms(&[]), Utc::now());

        let expired = registry.sweep(Utc::now(), Duration::from_secs(120));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sid, old);
        assert!(registry.get(&fresh).is_some());
    }

    #[test]
    fn registry_replacing_sid_entry_drops_stale_pid() {
        let registry = SessionRegistry::new();
        let sid = SocketId::from("s1");
        let first = registry.create(sid.clone(), "/", Offset(1));
        let second = registry.create(sid.clone(), "/", Offset(2));

        registry.suspend(&sid, rooms(&[]), Utc::now());
        assert_eq!(registry.find_recoverable(&first.pid), None);
        assert!(registry.find_recoverable(&second.pid).is_some());
    }
}
