//! Transport-agnostic contracts between servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_push::BroadcastOptions;
use skein_session::{ServerId, Uid};

/// Identifies one process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: ServerId,
    /// Role name, e.g. `connector`.
    pub server_type: String,
    pub host: String,
    pub port: u16,
    /// Whether clients connect to this server directly.
    #[serde(default)]
    pub frontend: bool,
}

/// One entry of a pushed message batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub route: String,
    #[serde(rename = "msg")]
    pub body: Value,
}

impl RemoteMessage {
    /// Message `body` pushed on `route`.
    pub fn new(route: impl Into<String>, body: Value) -> Self {
        Self {
            route: route.into(),
            body,
        }
    }
}

/// Reply of a batched push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushMsgsReply {
    /// One entry per message that could not be scheduled.
    pub errors: Vec<String>,
    /// Users with no session on the target server.
    pub fails: Vec<Uid>,
}

/// Failure of a single call to another server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("server {0} is unreachable")]
    Unreachable(ServerId),

    #[error("rpc to server {0} timed out")]
    Timeout(ServerId),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Client side of the frontend push entry points.
///
/// Implemented by whatever RPC transport the application runs.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Push one message to `uids` on `server`. Returns the uids with no
    /// session there.
    async fn push_message(
        &self,
        server: &ServerId,
        route: &str,
        body: &Value,
        uids: &[Uid],
    ) -> Result<Vec<Uid>, RpcError>;

    /// Push a batch of messages to `uids` on `server`.
    async fn push_msgs(
        &self,
        server: &ServerId,
        messages: &[RemoteMessage],
        uids: &[Uid],
    ) -> Result<PushMsgsReply, RpcError>;

    /// Broadcast to every client of `server`.
    async fn broadcast(
        &self,
        server: &ServerId,
        route: &str,
        body: &Value,
        options: &BroadcastOptions,
    ) -> Result<(), RpcError>;
}

/// Lists the servers currently in the cluster.
pub trait ServerDirectory: Send + Sync {
    /// Servers whose `server_type` matches.
    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo>;
}

/// Fixed server list.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    servers: Vec<ServerInfo>,
}

impl StaticDirectory {
    /// Directory over a fixed list of servers.
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self { servers }
    }
}

impl ServerDirectory for StaticDirectory {
    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        self.servers
            .iter()
            .filter(|server| server.server_type == server_type)
            .cloned()
            .collect()
    }
}
