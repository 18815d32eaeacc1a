//! Entry points a frontend server exposes to the rest of the cluster.

use std::sync::Arc;

use serde_json::{Map, Value};
use skein_connector::Connector;
use skein_push::{BroadcastOptions, PushTarget};
use skein_session::{FrontendSession, SessionError, SessionId, SessionRegistry, Uid};

use crate::error::FanoutError;
use crate::rpc::{PushMsgsReply, RemoteMessage};

/// Frontend side of the push and session contracts.
///
/// An RPC server hands incoming calls to these methods; [`crate::ClusterFanout`]
/// calls them directly for the local group.
pub struct FrontendRemote {
    connector: Arc<Connector>,
}

impl FrontendRemote {
    /// Serve cluster calls against `connector`'s sessions.
    pub fn new(connector: Arc<Connector>) -> Self {
        Self { connector }
    }

    fn sessions(&self) -> &Arc<SessionRegistry> {
        self.connector.sessions()
    }

    /// Resolve uids to local session ids; uids with no session go to `fails`.
    async fn resolve(&self, uids: &[Uid]) -> (Vec<SessionId>, Vec<Uid>) {
        let mut sids = Vec::new();
        let mut fails = Vec::new();
        for uid in uids {
            let found = self.sessions().session_ids_by_uid(uid).await;
            if found.is_empty() {
                fails.push(uid.clone());
            } else {
                sids.extend(found);
            }
        }
        (sids, fails)
    }

    /// Push one message to the sessions of `uids`.
    ///
    /// Returns the uids that have no session on this server.
    pub async fn push_message(
        &self,
        route: &str,
        body: &Value,
        uids: &[Uid],
    ) -> Result<Vec<Uid>, FanoutError> {
        if body.is_null() {
            tracing::error!("Can not send empty message! route : {route}");
            return Err(FanoutError::EmptyMessage);
        }

        let (sids, fails) = self.resolve(uids).await;
        tracing::debug!(
            "[{}] pushMessage uids: {uids:?}, route: {route}, sids: {sids:?}",
            self.connector.server_id()
        );
        if !sids.is_empty() {
            self.connector
                .send(None, route, body, PushTarget::Sessions(sids))
                .await?;
        }
        Ok(fails)
    }

    /// Push a batch of messages, in order, to the sessions of `uids`.
    pub async fn push_msgs(
        &self,
        messages: &[RemoteMessage],
        uids: &[Uid],
    ) -> Result<PushMsgsReply, FanoutError> {
        if messages.is_empty() {
            return Ok(PushMsgsReply::default());
        }

        let (sids, fails) = self.resolve(uids).await;
        let mut errors = Vec::new();
        if !sids.is_empty() {
            for message in messages {
                let target = PushTarget::Sessions(sids.clone());
                if let Err(e) = self
                    .connector
                    .send(None, &message.route, &message.body, target)
                    .await
                {
                    errors.push(e.to_string());
                }
            }
        }
        Ok(PushMsgsReply { errors, fails })
    }

    /// Push to every client of this server.
    pub async fn broadcast(
        &self,
        route: &str,
        body: &Value,
        options: BroadcastOptions,
    ) -> Result<usize, FanoutError> {
        Ok(self
            .connector
            .send(None, route, body, PushTarget::Broadcast(options))
            .await?)
    }

    /// Bind session `sid` to `uid`.
    pub async fn bind(&self, sid: SessionId, uid: Uid) -> Result<(), SessionError> {
        self.sessions().bind(sid, uid).await
    }

    /// Unbind session `sid` from `uid`.
    pub async fn unbind(&self, sid: SessionId, uid: Uid) -> Result<(), SessionError> {
        self.sessions().unbind(sid, uid).await
    }

    /// Snapshots of every local session bound to `uid`.
    pub async fn get_sessions_by_uid(&self, uid: &Uid) -> Vec<FrontendSession> {
        self.sessions().get_by_uid(uid).await
    }

    /// Snapshot of session `sid`, if it is still open.
    pub async fn get_session_by_sid(&self, sid: SessionId) -> Option<FrontendSession> {
        self.sessions().get(sid).await
    }

    /// Kick one session. Returns whether it existed.
    pub async fn kick_by_session_id(&self, sid: SessionId, reason: &str) -> bool {
        self.sessions().kick_by_session_id(sid, reason).await
    }

    /// Kick every session of `uid`. Returns how many were kicked.
    pub async fn kick_by_uid(&self, uid: &Uid, reason: &str) -> usize {
        self.sessions().kick(uid, reason).await
    }

    /// Apply one setting pushed from a backend server.
    pub async fn import(
        &self,
        sid: SessionId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), SessionError> {
        self.sessions().import(sid, key, value).await
    }

    /// Apply a settings map pushed from a backend server.
    pub async fn import_all(
        &self,
        sid: SessionId,
        settings: Map<String, Value>,
    ) -> Result<(), SessionError> {
        self.sessions().import_all(sid, settings).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skein_protocol::{Message, MessageKind, PacketType, decode};
    use skein_session::ServerId;

    use super::*;
    use crate::test_support::{RecordingSink, frontend};

    async fn connect(sessions: &SessionRegistry, sid: u64, uid: Option<&str>) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::default());
        sessions
            .create(SessionId(sid), ServerId::from("connector-1"), sink.clone())
            .await;
        if let Some(uid) = uid {
            sessions.bind(SessionId(sid), Uid::from(uid)).await.unwrap();
        }
        sink
    }

    fn routes(sink: &RecordingSink) -> Vec<String> {
        sink.sent()
            .iter()
            .map(|bytes| {
                let packets = decode(bytes).unwrap();
                assert_eq!(packets[0].kind, PacketType::Data);
                let message = Message::decode(&packets[0].body).unwrap();
                assert_eq!(message.kind, MessageKind::Push);
                match message.route {
                    Some(skein_protocol::Route::Name(name)) => name,
                    other => panic!("unexpected route {other:?}"),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_push_message_reports_users_without_sessions() {
        let (remote, sessions) = frontend("connector-1");
        let alice = connect(&sessions, 1, Some("alice")).await;

        let fails = remote
            .push_message(
                "onChat",
                &json!({ "msg": "hi" }),
                &[Uid::from("alice"), Uid::from("ghost")],
            )
            .await
            .unwrap();

        assert_eq!(fails, vec![Uid::from("ghost")]);
        assert_eq!(routes(&alice), vec!["onChat".to_string()]);
    }

    #[tokio::test]
    async fn test_null_body_is_rejected() {
        let (remote, _sessions) = frontend("connector-1");
        let err = remote
            .push_message("onChat", &Value::Null, &[Uid::from("alice")])
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::EmptyMessage));
    }

    #[tokio::test]
    async fn test_push_msgs_keeps_order() {
        let (remote, sessions) = frontend("connector-1");
        let alice = connect(&sessions, 1, Some("alice")).await;

        let messages = [
            RemoteMessage::new("onFirst", json!({})),
            RemoteMessage::new("onSecond", json!({})),
        ];
        let reply = remote
            .push_msgs(&messages, &[Uid::from("alice")])
            .await
            .unwrap();

        assert!(reply.errors.is_empty());
        assert!(reply.fails.is_empty());
        assert_eq!(routes(&alice), vec!["onFirst".to_string(), "onSecond".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_bound_only() {
        let (remote, sessions) = frontend("connector-1");
        let alice = connect(&sessions, 1, Some("alice")).await;
        let guest = connect(&sessions, 2, None).await;

        let options = BroadcastOptions {
            bound_only: true,
            ..BroadcastOptions::default()
        };
        let delivered = remote
            .broadcast("onNotice", &json!({}), options)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(alice.sent().len(), 1);
        assert!(guest.sent().is_empty());
    }

    #[tokio::test]
    async fn test_session_entry_points() {
        let (remote, sessions) = frontend("connector-1");
        let sink = connect(&sessions, 1, None).await;

        remote.bind(SessionId(1), Uid::from("alice")).await.unwrap();
        assert_eq!(remote.get_sessions_by_uid(&Uid::from("alice")).await.len(), 1);

        remote
            .import(SessionId(1), "room", json!("lobby"))
            .await
            .unwrap();
        let session = remote.get_session_by_sid(SessionId(1)).await.unwrap();
        assert_eq!(session.settings.get("room"), Some(&json!("lobby")));

        assert!(remote.import(SessionId(9), "room", json!(1)).await.is_err());

        assert_eq!(remote.kick_by_uid(&Uid::from("alice"), "bye").await, 1);
        assert_eq!(sink.kicks(), vec!["bye".to_string()]);
        assert!(remote.get_session_by_sid(SessionId(1)).await.is_none());
        assert!(!remote.kick_by_session_id(SessionId(1), "again").await);
    }
}
