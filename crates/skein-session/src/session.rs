//! Per-connection session record and the handle it uses to reach its socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ServerId, SessionId, Uid};

/// Outbound side of a live connection, as seen by the session layer.
///
/// Implemented by the connector. Every method is non-blocking: bytes are
/// queued to the connection task and written in order.
pub trait SessionSink: Send + Sync + 'static {
    /// Queue one encoded DATA packet. Returns `false` if the connection is gone.
    fn send(&self, packet: Bytes) -> bool;

    /// Queue several encoded DATA packets to be written as one batch.
    fn send_batch(&self, packets: Vec<Bytes>) -> bool;

    /// Send a KICK carrying `reason`, then disconnect.
    fn kick(&self, reason: &str);

    /// Peer address of the underlying transport.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Server-side record of one live client connection.
pub struct Session {
    id: SessionId,
    frontend_id: ServerId,
    uid: Option<Uid>,
    settings: Map<String, Value>,
    sink: Arc<dyn SessionSink>,
}

impl Session {
    pub(crate) fn new(id: SessionId, frontend_id: ServerId, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            id,
            frontend_id,
            uid: None,
            settings: Map::new(),
            sink,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Frontend server holding the connection.
    pub fn frontend_id(&self) -> &ServerId {
        &self.frontend_id
    }

    /// Bound user id, if any.
    pub fn uid(&self) -> Option<&Uid> {
        self.uid.as_ref()
    }

    /// Whether the session is bound to a user.
    pub fn is_bound(&self) -> bool {
        self.uid.is_some()
    }

    pub(crate) fn set_uid(&mut self, uid: Option<Uid>) {
        self.uid = uid;
    }

    /// Read a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Write a setting.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.settings.insert(key.into(), value);
    }

    /// Write several settings at once.
    pub fn set_all(&mut self, settings: Map<String, Value>) {
        self.settings.extend(settings);
    }

    /// Drop a setting.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.settings.remove(key)
    }

    /// All settings.
    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    /// Queue one encoded DATA packet to the client.
    pub fn send(&self, packet: Bytes) -> bool {
        self.sink.send(packet)
    }

    /// Queue a batch of encoded DATA packets to the client.
    pub fn send_batch(&self, packets: Vec<Bytes>) -> bool {
        self.sink.send_batch(packets)
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.sink.remote_addr()
    }

    pub(crate) fn sink(&self) -> &Arc<dyn SessionSink> {
        &self.sink
    }

    /// Snapshot exported to handlers and over RPC.
    pub fn to_frontend_session(&self) -> FrontendSession {
        FrontendSession {
            id: self.id,
            frontend_id: self.frontend_id.clone(),
            uid: self.uid.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("frontend_id", &self.frontend_id)
            .field("uid", &self.uid)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Detached copy of a session, used as the session descriptor for handlers
/// and remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendSession {
    /// Session id.
    pub id: SessionId,
    /// Frontend server holding the connection.
    pub frontend_id: ServerId,
    /// Bound user id.
    #[serde(default)]
    pub uid: Option<Uid>,
    /// Settings at the time of export.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Lifecycle notifications published by the session registry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was bound to a user.
    Bound {
        /// Session id.
        session: SessionId,
        /// User id.
        uid: Uid,
    },
    /// A session was unbound from a user.
    Unbound {
        /// Session id.
        session: SessionId,
        /// User id.
        uid: Uid,
    },
    /// A session was removed. `reason` is set when it was kicked.
    Closed {
        /// Final snapshot of the session.
        session: FrontendSession,
        /// Kick reason, if any.
        reason: Option<String>,
    },
}
