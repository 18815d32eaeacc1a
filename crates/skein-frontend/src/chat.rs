//! Chat-room request handling for the frontend binary.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use skein_cluster::{ClusterFanout, PushMsgsReply, RemoteClient, RemoteMessage, RpcError};
use skein_connector::{DecodedMessage, HandlerError, MessageHandler};
use skein_push::BroadcastOptions;
use skein_session::{
    ChannelRegistry, FrontendSession, ServerId, SessionEvent, SessionRegistry, Uid,
};
use tokio::sync::broadcast;

const ROOM_KEY: &str = "rid";

/// Handles `connector.entryHandler.*`; echoes everything else.
pub struct ChatHandler {
    server_id: ServerId,
    sessions: Arc<SessionRegistry>,
    channels: Arc<ChannelRegistry>,
    fanout: OnceLock<Arc<ClusterFanout>>,
}

impl ChatHandler {
    pub fn new(
        server_id: ServerId,
        sessions: Arc<SessionRegistry>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            server_id,
            sessions,
            channels,
            fanout: OnceLock::new(),
        }
    }

    /// Install the fan-out once the connector it depends on exists.
    pub fn set_fanout(&self, fanout: Arc<ClusterFanout>) {
        if self.fanout.set(fanout).is_err() {
            tracing::warn!("[{}] fan-out already installed", self.server_id);
        }
    }

    async fn push_to_room(&self, room: &str, route: &str, body: Value) {
        let Some(fanout) = self.fanout.get() else {
            tracing::warn!("[{}] no fan-out installed, drop {route}", self.server_id);
            return;
        };
        match fanout.push_to_channel(room, route, &body).await {
            Ok(fails) if !fails.is_empty() => {
                tracing::debug!("[{}] {route} missed users {fails:?}", self.server_id);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("[{}] push {route} to room {room} failed: {e}", self.server_id),
        }
    }

    async fn enter(
        &self,
        body: &Value,
        session: &FrontendSession,
    ) -> Result<Option<Value>, HandlerError> {
        let uid = body
            .get("uid")
            .and_then(Value::as_str)
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                HandlerError::with_body("missing uid", json!({ "code": 500, "error": true }))
            })?;
        let room = body.get(ROOM_KEY).and_then(Value::as_str).unwrap_or("lobby");
        let uid = Uid::from(uid);

        self.sessions
            .bind(session.id, uid.clone())
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;
        self.sessions
            .import(session.id, ROOM_KEY, json!(room))
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;

        let channel = self.channels.create_channel(room).await;
        channel.add(uid.clone(), self.server_id.clone()).await;
        self.push_to_room(room, "onAdd", json!({ "user": uid.as_str() }))
            .await;

        let members = channel.members().await;
        let users: Vec<&str> = members.iter().map(Uid::as_str).collect();
        Ok(Some(json!({ "code": 200, "users": users })))
    }

    async fn send(
        &self,
        body: &Value,
        session: &FrontendSession,
    ) -> Result<Option<Value>, HandlerError> {
        let Some(uid) = &session.uid else {
            return Err(HandlerError::new("session is not bound"));
        };
        let room = session
            .settings
            .get(ROOM_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("session has not entered a room"))?;
        let content = body.get("content").cloned().unwrap_or(Value::Null);

        self.push_to_room(
            room,
            "onChat",
            json!({ "from": uid.as_str(), "msg": content }),
        )
        .await;
        Ok(Some(json!({ "code": 200 })))
    }

    async fn leave(&self, uid: &Uid, room: &str) {
        let Some(channel) = self.channels.get_channel(room, false).await else {
            return;
        };
        if channel.leave(uid, &self.server_id).await {
            self.push_to_room(room, "onLeave", json!({ "user": uid.as_str() }))
                .await;
        }
    }
}

#[async_trait]
impl MessageHandler for ChatHandler {
    async fn handle(
        &self,
        message: DecodedMessage,
        session: FrontendSession,
    ) -> Result<Option<Value>, HandlerError> {
        match message.route.as_str() {
            "connector.entryHandler.entry" => self.enter(&message.body, &session).await,
            "connector.entryHandler.send" => self.send(&message.body, &session).await,
            route => Ok(Some(json!({ "code": 200, "route": route, "body": message.body }))),
        }
    }
}

/// Take users out of their room when their session closes.
pub async fn leave_on_close(
    handler: Arc<ChatHandler>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Closed { session, reason }) => {
                let (Some(uid), Some(room)) = (
                    session.uid.as_ref(),
                    session.settings.get(ROOM_KEY).and_then(Value::as_str),
                ) else {
                    continue;
                };
                tracing::debug!("user {uid} left room {room}, reason: {reason:?}");
                handler.leave(uid, room).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("room cleanup missed {missed} session events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// RPC client for a single-process deployment: every other server is
/// unreachable.
pub struct NoRemote;

#[async_trait]
impl RemoteClient for NoRemote {
    async fn push_message(
        &self,
        server: &ServerId,
        _route: &str,
        _body: &Value,
        _uids: &[Uid],
    ) -> Result<Vec<Uid>, RpcError> {
        Err(RpcError::Unreachable(server.clone()))
    }

    async fn push_msgs(
        &self,
        server: &ServerId,
        _messages: &[RemoteMessage],
        _uids: &[Uid],
    ) -> Result<PushMsgsReply, RpcError> {
        Err(RpcError::Unreachable(server.clone()))
    }

    async fn broadcast(
        &self,
        server: &ServerId,
        _route: &str,
        _body: &Value,
        _options: &BroadcastOptions,
    ) -> Result<(), RpcError> {
        Err(RpcError::Unreachable(server.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use skein_cluster::{FrontendRemote, StaticDirectory};
    use skein_config::{ClusterConfig, ConnectorConfig, PushConfig};
    use skein_connector::Connector;
    use skein_protocol::{Message, Route, decode};
    use skein_push::create_scheduler;
    use skein_session::{SessionConfig, SessionId, SessionSink};

    use super::*;

    #[derive(Default)]
    struct Inbox {
        routes: Mutex<Vec<String>>,
    }

    impl Inbox {
        fn routes(&self) -> Vec<String> {
            self.routes.lock().unwrap().clone()
        }
    }

    impl SessionSink for Inbox {
        fn send(&self, packet: Bytes) -> bool {
            let packets = decode(&packet).unwrap();
            let message = Message::decode(&packets[0].body).unwrap();
            if let Some(Route::Name(route)) = message.route {
                self.routes.lock().unwrap().push(route);
            }
            true
        }

        fn send_batch(&self, packets: Vec<Bytes>) -> bool {
            packets.into_iter().all(|packet| self.send(packet))
        }

        fn kick(&self, _reason: &str) {}

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    struct Room {
        handler: Arc<ChatHandler>,
        sessions: Arc<SessionRegistry>,
        channels: Arc<ChannelRegistry>,
    }

    fn room() -> Room {
        let server_id = ServerId::from("connector-server-1");
        let sessions = Arc::new(SessionRegistry::new(
            server_id.clone(),
            SessionConfig::default(),
        ));
        let channels = Arc::new(ChannelRegistry::new(server_id.clone(), "skein:channel", None));
        let handler = Arc::new(ChatHandler::new(
            server_id.clone(),
            Arc::clone(&sessions),
            Arc::clone(&channels),
        ));
        let scheduler = create_scheduler(&PushConfig::default(), Arc::clone(&sessions), None);
        let connector = Connector::builder(
            server_id.clone(),
            ConnectorConfig::default(),
            Arc::clone(&sessions),
            scheduler,
            handler.clone(),
        )
        .build()
        .unwrap();
        let fanout = ClusterFanout::new(
            server_id,
            &ClusterConfig::default(),
            Arc::new(NoRemote),
            Arc::new(StaticDirectory::default()),
            Arc::clone(&channels),
        )
        .with_local(Arc::new(FrontendRemote::new(Arc::new(connector))));
        handler.set_fanout(Arc::new(fanout));
        Room {
            handler,
            sessions,
            channels,
        }
    }

    async fn join(room: &Room, sid: u64) -> (Arc<Inbox>, FrontendSession) {
        let inbox = Arc::new(Inbox::default());
        let session = room
            .sessions
            .create(SessionId(sid), ServerId::from("connector-server-1"), inbox.clone())
            .await;
        (inbox, session)
    }

    fn request(route: &str, body: Value) -> DecodedMessage {
        DecodedMessage {
            kind: skein_protocol::MessageKind::Request,
            id: Some(1),
            route: route.to_string(),
            body,
        }
    }

    #[tokio::test]
    async fn test_enter_binds_and_announces() {
        let room = room();
        let (alice_inbox, alice) = join(&room, 1).await;

        let reply = room
            .handler
            .handle(
                request("connector.entryHandler.entry", json!({ "uid": "alice", "rid": "r1" })),
                alice,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply, json!({ "code": 200, "users": ["alice"] }));
        assert_eq!(
            room.sessions.session_ids_by_uid(&Uid::from("alice")).await,
            vec![SessionId(1)]
        );
        assert_eq!(alice_inbox.routes(), vec!["onAdd".to_string()]);
    }

    #[tokio::test]
    async fn test_enter_without_uid_is_an_error() {
        let room = room();
        let (_inbox, session) = join(&room, 1).await;
        let err = room
            .handler
            .handle(request("connector.entryHandler.entry", json!({})), session)
            .await
            .unwrap_err();
        assert_eq!(err.body, Some(json!({ "code": 500, "error": true })));
    }

    #[tokio::test]
    async fn test_chat_reaches_room_and_close_leaves() {
        let room = room();
        tokio::spawn(leave_on_close(
            Arc::clone(&room.handler),
            room.sessions.subscribe(),
        ));
        let (alice_inbox, alice) = join(&room, 1).await;
        let (_bob_inbox, bob) = join(&room, 2).await;
        let entry = "connector.entryHandler.entry";
        room.handler
            .handle(request(entry, json!({ "uid": "alice", "rid": "r1" })), alice)
            .await
            .unwrap();
        room.handler
            .handle(request(entry, json!({ "uid": "bob", "rid": "r1" })), bob)
            .await
            .unwrap();

        let bob = room.sessions.get(SessionId(2)).await.unwrap();
        room.handler
            .handle(
                request("connector.entryHandler.send", json!({ "content": "hi" })),
                bob,
            )
            .await
            .unwrap();
        assert_eq!(
            alice_inbox.routes(),
            vec!["onAdd".to_string(), "onAdd".to_string(), "onChat".to_string()]
        );

        room.sessions.remove(SessionId(2)).await;
        let channel = room.channels.get_channel("r1", false).await.unwrap();
        for _ in 0..50 {
            if channel.user_amount().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(channel.members().await, vec![Uid::from("alice")]);
    }

    #[tokio::test]
    async fn test_other_routes_are_echoed() {
        let room = room();
        let (_inbox, session) = join(&room, 1).await;
        let reply = room
            .handler
            .handle(request("connector.misc.ping", json!({ "n": 1 })), session)
            .await
            .unwrap();
        assert_eq!(
            reply,
            Some(json!({ "code": 200, "route": "connector.misc.ping", "body": { "n": 1 } }))
        );
    }
}
