//! Session registry: live sessions by id, and the uid → sessions relation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast};

use crate::ids::{ServerId, SessionId, Uid};
use crate::session::{FrontendSession, Session, SessionEvent, SessionSink};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 1024;

/// Errors returned by bind/unbind and other session lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with this id.
    #[error("session does not exist, sid: {0}")]
    NoSuchSession(SessionId),

    /// The session is already bound to a different user.
    #[error("session {session} has already bound with {bound}")]
    AlreadyBoundToOtherUser {
        /// Session id.
        session: SessionId,
        /// The user it is bound to.
        bound: Uid,
    },

    /// Single-session mode is on and the user already has a session.
    #[error("single session is enabled and uid {0} is already bound")]
    SingleSessionViolation(Uid),

    /// The session is not bound to the given user.
    #[error("session {session} is not bound with {uid}")]
    NotBound {
        /// Session id.
        session: SessionId,
        /// The uid the caller expected.
        uid: Uid,
    },
}

/// Registry options.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// At most one session per user.
    pub single_session: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    by_uid: HashMap<Uid, Vec<SessionId>>,
}

impl Inner {
    fn detach_uid(&mut self, sid: SessionId, uid: &Uid) {
        if let Some(list) = self.by_uid.get_mut(uid) {
            list.retain(|id| *id != sid);
            if list.is_empty() {
                self.by_uid.remove(uid);
            }
        }
    }
}

/// Process-local registry of live sessions.
pub struct SessionRegistry {
    server_id: ServerId,
    config: SessionConfig,
    inner: RwLock<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Create an empty registry for the frontend `server_id`.
    pub fn new(server_id: ServerId, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server_id,
            config,
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// The frontend server this registry belongs to.
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Register a session for a new connection. An existing session with the
    /// same id is returned unchanged.
    pub async fn create(
        &self,
        sid: SessionId,
        frontend_id: ServerId,
        sink: Arc<dyn SessionSink>,
    ) -> FrontendSession {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .entry(sid)
            .or_insert_with(|| Session::new(sid, frontend_id, sink));
        tracing::debug!("[{}] session {sid} created", self.server_id);
        session.to_frontend_session()
    }

    /// Bind a session to a user.
    pub async fn bind(&self, sid: SessionId, uid: Uid) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get(&sid)
            .ok_or(SessionError::NoSuchSession(sid))?;

        if let Some(bound) = session.uid() {
            if *bound == uid {
                return Ok(());
            }
            return Err(SessionError::AlreadyBoundToOtherUser {
                session: sid,
                bound: bound.clone(),
            });
        }

        if self.config.single_session && inner.by_uid.contains_key(&uid) {
            return Err(SessionError::SingleSessionViolation(uid));
        }

        let list = inner.by_uid.entry(uid.clone()).or_default();
        if !list.contains(&sid) {
            list.push(sid);
        }
        if let Some(session) = inner.sessions.get_mut(&sid) {
            session.set_uid(Some(uid.clone()));
        }
        drop(inner);

        tracing::debug!("[{}] session {sid} bound with uid {uid}", self.server_id);
        self.emit(SessionEvent::Bound { session: sid, uid });
        Ok(())
    }

    /// Unbind a session from a user.
    pub async fn unbind(&self, sid: SessionId, uid: Uid) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&sid)
            .ok_or(SessionError::NoSuchSession(sid))?;

        if session.uid() != Some(&uid) {
            return Err(SessionError::NotBound { session: sid, uid });
        }
        session.set_uid(None);
        inner.detach_uid(sid, &uid);
        drop(inner);

        self.emit(SessionEvent::Unbound { session: sid, uid });
        Ok(())
    }

    /// Snapshot of a session.
    pub async fn get(&self, sid: SessionId) -> Option<FrontendSession> {
        self.inner
            .read()
            .await
            .sessions
            .get(&sid)
            .map(Session::to_frontend_session)
    }

    /// Whether a session is live.
    pub async fn contains(&self, sid: SessionId) -> bool {
        self.inner.read().await.sessions.contains_key(&sid)
    }

    /// Snapshots of every session bound to `uid`.
    pub async fn get_by_uid(&self, uid: &Uid) -> Vec<FrontendSession> {
        let inner = self.inner.read().await;
        inner
            .by_uid
            .get(uid)
            .into_iter()
            .flatten()
            .filter_map(|sid| inner.sessions.get(sid))
            .map(Session::to_frontend_session)
            .collect()
    }

    /// Session ids bound to `uid`.
    pub async fn session_ids_by_uid(&self, uid: &Uid) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .by_uid
            .get(uid)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a session after its connection closed.
    pub async fn remove(&self, sid: SessionId) -> Option<FrontendSession> {
        self.close(sid, None).await.map(|(session, _)| session)
    }

    async fn close(
        &self,
        sid: SessionId,
        reason: Option<String>,
    ) -> Option<(FrontendSession, Arc<dyn SessionSink>)> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(&sid)?;
        if let Some(uid) = session.uid() {
            inner.detach_uid(sid, uid);
        }
        drop(inner);

        let snapshot = session.to_frontend_session();
        tracing::debug!("[{}] session {sid} closed", self.server_id);
        self.emit(SessionEvent::Closed {
            session: snapshot.clone(),
            reason,
        });
        Some((snapshot, Arc::clone(session.sink())))
    }

    /// Kick every session bound to `uid`. Returns how many were kicked.
    pub async fn kick(&self, uid: &Uid, reason: &str) -> usize {
        let sids = self.session_ids_by_uid(uid).await;
        let mut kicked = 0;
        for sid in sids {
            if self.kick_by_session_id(sid, reason).await {
                kicked += 1;
            }
        }
        kicked
    }

    /// Kick one session. Returns `false` if it did not exist.
    pub async fn kick_by_session_id(&self, sid: SessionId, reason: &str) -> bool {
        match self.close(sid, Some(reason.to_string())).await {
            Some((_, sink)) => {
                sink.kick(reason);
                true
            }
            None => false,
        }
    }

    /// Set one setting on a session.
    pub async fn import(
        &self,
        sid: SessionId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), SessionError> {
        self.with_session_mut(sid, |session| session.set(key, value))
            .await
    }

    /// Set several settings on a session.
    pub async fn import_all(
        &self,
        sid: SessionId,
        settings: Map<String, Value>,
    ) -> Result<(), SessionError> {
        self.with_session_mut(sid, |session| session.set_all(settings))
            .await
    }

    /// Run `f` against a session under the registry lock.
    pub async fn with_session_mut<R>(
        &self,
        sid: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&sid)
            .ok_or(SessionError::NoSuchSession(sid))?;
        Ok(f(session))
    }

    /// Queue an encoded packet to one session.
    pub async fn send_message(&self, sid: SessionId, packet: Bytes) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(&sid) {
            Some(session) => session.send(packet),
            None => {
                tracing::debug!("fail to send message for non-existing session, sid: {sid}");
                false
            }
        }
    }

    /// Queue a batch of encoded packets to one session.
    pub async fn send_batch(&self, sid: SessionId, packets: Vec<Bytes>) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(&sid) {
            Some(session) => session.send_batch(packets),
            None => false,
        }
    }

    /// Queue an encoded packet to every session of a user.
    pub async fn send_message_by_uid(&self, uid: &Uid, packet: Bytes) -> bool {
        let inner = self.inner.read().await;
        let Some(sids) = inner.by_uid.get(uid) else {
            tracing::debug!("fail to send message by uid for non-existing session, uid: {uid}");
            return false;
        };
        for sid in sids {
            if let Some(session) = inner.sessions.get(sid) {
                session.send(packet.clone());
            }
        }
        true
    }

    /// Visit every session.
    pub async fn for_each_session(&self, mut f: impl FnMut(&Session)) {
        let inner = self.inner.read().await;
        for session in inner.sessions.values() {
            f(session);
        }
    }

    /// Visit every session bound to a user.
    pub async fn for_each_bound_session(&self, mut f: impl FnMut(&Session)) {
        let inner = self.inner.read().await;
        for sids in inner.by_uid.values() {
            for sid in sids {
                if let Some(session) = inner.sessions.get(sid) {
                    f(session);
                }
            }
        }
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Peer address of a session's connection.
    pub async fn client_address(&self, sid: SessionId) -> Option<SocketAddr> {
        self.inner
            .read()
            .await
            .sessions
            .get(&sid)
            .and_then(Session::remote_addr)
    }
}
