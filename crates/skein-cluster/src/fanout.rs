//! Cross-server push: group recipients by owning frontend, deliver each
//! group locally or over RPC, and merge the outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use skein_config::ClusterConfig;
use skein_push::BroadcastOptions;
use skein_session::{ChannelMember, ChannelRegistry, ServerId, Uid};

use crate::error::FanoutError;
use crate::frontend::FrontendRemote;
use crate::rpc::{RemoteClient, RemoteMessage, RpcError, ServerDirectory};

enum Payload<'a> {
    One { route: &'a str, body: &'a Value },
    Batch(&'a [RemoteMessage]),
}

/// Result of delivering to one group.
struct GroupOutcome {
    fails: Vec<Uid>,
    ok: bool,
}

/// Pushes to users spread across frontend servers.
///
/// A call succeeds when at least one group succeeds. Users that were not
/// reached, including every user of a failed or timed-out group, are
/// returned in `fails`.
pub struct ClusterFanout {
    server_id: ServerId,
    client: Arc<dyn RemoteClient>,
    directory: Arc<dyn ServerDirectory>,
    channels: Arc<ChannelRegistry>,
    local: Option<Arc<FrontendRemote>>,
    rpc_timeout: Duration,
}

impl ClusterFanout {
    /// Fan-out for `server_id`, with `config.rpc_timeout()` per group.
    pub fn new(
        server_id: ServerId,
        config: &ClusterConfig,
        client: Arc<dyn RemoteClient>,
        directory: Arc<dyn ServerDirectory>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            server_id,
            client,
            directory,
            channels,
            local: None,
            rpc_timeout: config.rpc_timeout(),
        }
    }

    /// Deliver groups owned by this server without going through RPC.
    pub fn with_local(mut self, local: Arc<FrontendRemote>) -> Self {
        self.local = Some(local);
        self
    }

    /// Push one message to `recipients`. Returns the uids not reached.
    pub async fn push_message_by_uids(
        &self,
        route: &str,
        body: &Value,
        recipients: &[ChannelMember],
    ) -> Result<Vec<Uid>, FanoutError> {
        if recipients.is_empty() {
            return Err(FanoutError::EmptyRecipients);
        }
        let (groups, skipped) = group_by_server(recipients);
        self.send_by_group(groups, skipped, Payload::One { route, body })
            .await
    }

    /// Push a batch of messages to `recipients`.
    pub async fn push_msgs_by_uids(
        &self,
        messages: &[RemoteMessage],
        recipients: &[ChannelMember],
    ) -> Result<Vec<Uid>, FanoutError> {
        if recipients.is_empty() {
            return Err(FanoutError::EmptyRecipients);
        }
        let (groups, skipped) = group_by_server(recipients);
        self.send_by_group(groups, skipped, Payload::Batch(messages))
            .await
    }

    /// Push one message to every member of a channel.
    pub async fn push_to_channel(
        &self,
        channel: &str,
        route: &str,
        body: &Value,
    ) -> Result<Vec<Uid>, FanoutError> {
        let Some(found) = self.channels.get_channel(channel, false).await else {
            return Err(FanoutError::NoSuchChannel(channel.to_string()));
        };
        if found.is_destroyed().await {
            return Err(FanoutError::ChannelDestroyed(channel.to_string()));
        }
        let groups = found.groups().await;
        self.send_by_group(groups, Vec::new(), Payload::One { route, body })
            .await
    }

    /// Broadcast to every client of every server of `server_type`.
    ///
    /// An empty server list counts as success.
    pub async fn broadcast(
        &self,
        server_type: &str,
        route: &str,
        body: &Value,
        options: BroadcastOptions,
    ) -> Result<(), FanoutError> {
        let servers = self.directory.servers_by_type(server_type);
        if servers.is_empty() {
            return Ok(());
        }

        let options = &options;
        let calls = servers.iter().map(|server| async move {
            let call = self.broadcast_one(&server.id, route, body, options);
            (&server.id, tokio::time::timeout(self.rpc_timeout, call).await)
        });

        let mut success = false;
        for (server, result) in join_all(calls).await {
            match result {
                Ok(Ok(())) => success = true,
                Ok(Err(e)) => {
                    tracing::error!("[broadcast] fail to push message to serverId: {server}, err: {e}");
                }
                Err(_) => {
                    tracing::error!("[broadcast] push to serverId: {server} timed out");
                }
            }
        }

        if success {
            Ok(())
        } else {
            Err(FanoutError::BroadcastFailed)
        }
    }

    async fn broadcast_one(
        &self,
        server: &ServerId,
        route: &str,
        body: &Value,
        options: &BroadcastOptions,
    ) -> Result<(), RpcError> {
        match &self.local {
            Some(local) if *server == self.server_id => local
                .broadcast(route, body, options.clone())
                .await
                .map(|_| ())
                .map_err(|e| RpcError::Remote(e.to_string())),
            _ => self.client.broadcast(server, route, body, options).await,
        }
    }

    async fn send_by_group(
        &self,
        groups: HashMap<ServerId, Vec<Uid>>,
        skipped: Vec<Uid>,
        payload: Payload<'_>,
    ) -> Result<Vec<Uid>, FanoutError> {
        tracing::debug!(
            "[{}] send message by group, groups: {groups:?}",
            self.server_id
        );
        if groups.is_empty() {
            if skipped.is_empty() {
                return Ok(Vec::new());
            }
            return Err(FanoutError::AllGroupsFailed { fails: skipped });
        }

        let payload = &payload;
        let calls = groups.iter().map(|(server, uids)| async move {
            let call = self.deliver(server, uids, payload);
            (server, uids, tokio::time::timeout(self.rpc_timeout, call).await)
        });

        let mut success = false;
        let mut fails = skipped;
        for (server, uids, result) in join_all(calls).await {
            match result {
                Ok(Ok(outcome)) => {
                    success |= outcome.ok;
                    fails.extend(outcome.fails);
                }
                Ok(Err(e)) => {
                    tracing::error!("[pushMessage] fail to dispatch msg to serverId: {server}, err: {e}");
                    fails.extend(uids.iter().cloned());
                }
                Err(_) => {
                    tracing::error!(
                        "[pushMessage] dispatch to serverId: {server} timed out after {:?}",
                        self.rpc_timeout
                    );
                    fails.extend(uids.iter().cloned());
                }
            }
        }

        if success {
            Ok(fails)
        } else {
            Err(FanoutError::AllGroupsFailed { fails })
        }
    }

    async fn deliver(
        &self,
        server: &ServerId,
        uids: &[Uid],
        payload: &Payload<'_>,
    ) -> Result<GroupOutcome, RpcError> {
        let local = self
            .local
            .as_ref()
            .filter(|_| *server == self.server_id);

        match payload {
            Payload::One { route, body } => {
                let fails = match local {
                    Some(local) => local
                        .push_message(route, body, uids)
                        .await
                        .map_err(|e| RpcError::Remote(e.to_string()))?,
                    None => self.client.push_message(server, route, body, uids).await?,
                };
                Ok(GroupOutcome { fails, ok: true })
            }
            Payload::Batch(messages) => {
                let reply = match local {
                    Some(local) => local
                        .push_msgs(messages, uids)
                        .await
                        .map_err(|e| RpcError::Remote(e.to_string()))?,
                    None => self.client.push_msgs(server, messages, uids).await?,
                };
                for e in &reply.errors {
                    tracing::error!("[pushMessage] fail to dispatch msg to serverId: {server}, err: {e}");
                }
                Ok(GroupOutcome {
                    ok: reply.errors.is_empty(),
                    fails: reply.fails,
                })
            }
        }
    }
}

/// Group uids by owning server. Uids of records without a server are
/// returned separately.
fn group_by_server(recipients: &[ChannelMember]) -> (HashMap<ServerId, Vec<Uid>>, Vec<Uid>) {
    let mut groups: HashMap<ServerId, Vec<Uid>> = HashMap::new();
    let mut skipped = Vec::new();
    for record in recipients {
        if record.server_id.is_empty() {
            tracing::warn!("ignore uid {} without a frontend server id", record.uid);
            skipped.push(record.uid.clone());
            continue;
        }
        groups
            .entry(record.server_id.clone())
            .or_default()
            .push(record.uid.clone());
    }
    (groups, skipped)
}
