//! Client-facing connector: accept loop, protocol switch and connection
//! wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use skein_config::ConnectorConfig;
use skein_protocol::FrameConfig;
use skein_push::{PushScheduler, PushTarget};
use skein_session::{ConnectionStats, ServerId, SessionEvent, SessionId, SessionRegistry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};

use crate::coder::{Coder, DecodedMessage};
use crate::dictionary::RouteDictionary;
use crate::error::{CoderError, ConnectorError};
use crate::handler::MessageHandler;
use crate::handshake::{ClientCheck, HandshakeCommand, HandshakeHook};
use crate::schema::SchemaCodec;
use crate::socket::{Socket, SocketHandle};
use crate::switcher::{Protocol, sniff};
use crate::transport::{Inbound, TcpWriter, WsWriter, spawn_tcp_reader, spawn_ws_reader};

/// Depth of the reader-to-socket packet queue.
const INBOUND_QUEUE: usize = 64;

/// Atomic generator for connection ids, which double as session ids.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique id.
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every connection of one connector.
pub(crate) struct ConnectorShared {
    pub(crate) server_id: ServerId,
    pub(crate) config: ConnectorConfig,
    pub(crate) frame: FrameConfig,
    pub(crate) coder: Coder,
    pub(crate) handshake: HandshakeCommand,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) scheduler: Arc<dyn PushScheduler>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) stats: Arc<ConnectionStats>,
}

impl ConnectorShared {
    pub(crate) async fn send(
        &self,
        id: Option<u64>,
        route: &str,
        body: &Value,
        target: PushTarget,
    ) -> Result<usize, ConnectorError> {
        tracing::debug!(
            "[{}] send message id: {id:?}, route: {route}, target: {target:?}",
            self.server_id
        );
        let packet = self.coder.encode(id, route, body)?;
        Ok(self.scheduler.schedule(packet, target).await?)
    }

    pub(crate) async fn respond(
        &self,
        sid: SessionId,
        id: u64,
        route: &str,
        body: &Value,
    ) -> Result<usize, ConnectorError> {
        self.send(Some(id), route, body, PushTarget::Sessions(vec![sid]))
            .await
    }
}

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
    server_id: ServerId,
    config: ConnectorConfig,
    sessions: Arc<SessionRegistry>,
    scheduler: Arc<dyn PushScheduler>,
    handler: Arc<dyn MessageHandler>,
    stats: Option<Arc<ConnectionStats>>,
    dictionary: Option<RouteDictionary>,
    schema: Option<Arc<dyn SchemaCodec>>,
    check_client: Option<ClientCheck>,
    hook: Option<Arc<dyn HandshakeHook>>,
}

impl ConnectorBuilder {
    /// Route dictionary used when `use_dict` is on.
    pub fn with_dictionary(mut self, dictionary: RouteDictionary) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// Schema codec used when `use_proto` is on.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaCodec>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Client type/version check run during the handshake.
    pub fn with_client_check(mut self, check: ClientCheck) -> Self {
        self.check_client = Some(check);
        self
    }

    /// Application handshake hook.
    pub fn with_handshake_hook(mut self, hook: Arc<dyn HandshakeHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Share connection statistics with other components.
    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Finish building.
    pub fn build(self) -> Result<Connector, ConnectorError> {
        let dictionary = if self.config.use_dict {
            let dictionary = match self.dictionary {
                Some(dictionary) => dictionary,
                None => RouteDictionary::new(Vec::new(), Vec::new())?,
            };
            Some(Arc::new(dictionary))
        } else {
            None
        };
        let schema = if self.config.use_proto {
            if self.schema.is_none() {
                tracing::warn!("[{}] use_proto is on but no schema codec was given", self.server_id);
            }
            self.schema
        } else {
            None
        };

        let mut handshake = HandshakeCommand::new(self.config.heartbeat().map(|d| d.as_secs()));
        if let Some(check) = self.check_client {
            handshake = handshake.with_client_check(check);
        }
        if let Some(hook) = self.hook {
            handshake = handshake.with_hook(hook);
        }
        if let Some(dictionary) = &dictionary {
            handshake = handshake.with_dictionary(Arc::clone(dictionary));
        }
        if let Some(schema) = &schema {
            handshake = handshake.with_schema(Arc::clone(schema));
        }

        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(ConnectionStats::new(self.server_id.clone())));
        let frame = FrameConfig {
            max_packet_size: self.config.max_packet_size,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Connector {
            shared: Arc::new(ConnectorShared {
                server_id: self.server_id,
                config: self.config,
                frame,
                coder: Coder::new(dictionary, schema),
                handshake,
                sessions: self.sessions,
                scheduler: self.scheduler,
                handler: self.handler,
                stats,
            }),
            id_gen: IdGenerator::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }
}

/// Accepts raw TCP and WebSocket clients on one port.
pub struct Connector {
    shared: Arc<ConnectorShared>,
    id_gen: IdGenerator,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Connector {
    /// Start building a connector for `server_id`.
    pub fn builder(
        server_id: ServerId,
        config: ConnectorConfig,
        sessions: Arc<SessionRegistry>,
        scheduler: Arc<dyn PushScheduler>,
        handler: Arc<dyn MessageHandler>,
    ) -> ConnectorBuilder {
        ConnectorBuilder {
            server_id,
            config,
            sessions,
            scheduler,
            handler,
            stats: None,
            dictionary: None,
            schema: None,
            check_client: None,
            hook: None,
        }
    }

    /// This server's id.
    pub fn server_id(&self) -> &ServerId {
        &self.shared.server_id
    }

    /// Session registry the connector creates sessions in.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.shared.sessions
    }

    /// Push scheduler used for every outbound message.
    pub fn scheduler(&self) -> &Arc<dyn PushScheduler> {
        &self.shared.scheduler
    }

    /// Connection statistics.
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.shared.stats
    }

    /// Message coder.
    pub fn coder(&self) -> &Coder {
        &self.shared.coder
    }

    /// Encode a response (`id` set) or push.
    pub fn encode(&self, id: Option<u64>, route: &str, body: &Value) -> Result<Bytes, CoderError> {
        self.shared.coder.encode(id, route, body)
    }

    /// Decode the body of a DATA packet.
    pub fn decode(&self, data: &[u8]) -> Result<DecodedMessage, CoderError> {
        self.shared.coder.decode(data)
    }

    /// Encode a message and hand it to the push scheduler.
    ///
    /// Returns how many sessions the message was handed to.
    pub async fn send(
        &self,
        id: Option<u64>,
        route: &str,
        body: &Value,
        target: PushTarget,
    ) -> Result<usize, ConnectorError> {
        self.shared.send(id, route, body, target).await
    }

    /// Bind to `addr` and run the accept loop.
    pub async fn run(&self, addr: SocketAddr) -> Result<(), ConnectorError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("[{}] connector listening on {addr}", self.shared.server_id);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ConnectorError> {
        self.shared.scheduler.start().await;
        tokio::spawn(track_logins(
            Arc::clone(&self.shared),
            self.shared.sessions.subscribe(),
            self.shutdown_rx.clone(),
        ));

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("[{}] accept failed: {e}", self.shared.server_id);
                            continue;
                        }
                    };
                    if self.shared.config.set_no_delay
                        && let Err(e) = stream.set_nodelay(true)
                    {
                        tracing::debug!("set_nodelay failed for {peer}: {e}");
                    }

                    let total = self.shared.stats.increase_connection_count().await;
                    let max = self.shared.config.max_connections;
                    if max > 0 && total > max {
                        tracing::warn!(
                            "[{}] the server has reached the max connections {max}",
                            self.shared.server_id
                        );
                        self.shared.stats.decrease_connection_count(None).await;
                        drop(stream);
                        continue;
                    }

                    let id = self.id_gen.next_id();
                    tracing::info!("[{}] accepted connection {id} from {peer}", self.shared.server_id);
                    tokio::spawn(handle_stream(
                        Arc::clone(&self.shared),
                        id,
                        stream,
                        Some(peer),
                        self.shutdown_rx.clone(),
                    ));
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("[{}] connector shutting down", self.shared.server_id);
                        break;
                    }
                }
            }
        }

        self.shared.scheduler.stop().await;
        Ok(())
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Sniff, upgrade if needed, then run the socket until it closes.
async fn handle_stream<S>(
    shared: Arc<ConnectorShared>,
    id: SessionId,
    stream: S,
    peer: Option<SocketAddr>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    serve(&shared, id, stream, peer, shutdown).await;
    shared.stats.decrease_connection_count(None).await;
    tracing::info!("[{}] connection {id} finished", shared.server_id);
}

async fn serve<S>(
    shared: &Arc<ConnectorShared>,
    id: SessionId,
    stream: S,
    peer: Option<SocketAddr>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let window = shared.config.sniff_timeout();
    let (protocol, stream) = match within(window, sniff(stream)).await {
        Some(Ok(sniffed)) => sniffed,
        Some(Err(e)) => {
            tracing::debug!("[{}] connection {id} closed before sending data: {e}", shared.server_id);
            return;
        }
        None => {
            tracing::warn!(
                "[{}] connection is timeout without communication, the remote address is {peer:?}",
                shared.server_id
            );
            return;
        }
    };

    let (handle, commands) = SocketHandle::new(id, peer);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);

    match protocol {
        Protocol::WebSocket => {
            let upgraded = within(window, tokio_tungstenite::accept_async(stream)).await;
            let ws = match upgraded {
                Some(Ok(ws)) => ws,
                Some(Err(e)) => {
                    tracing::debug!("[{}] websocket upgrade of {id} failed: {e}", shared.server_id);
                    return;
                }
                None => {
                    tracing::warn!("[{}] websocket upgrade of {id} timed out", shared.server_id);
                    return;
                }
            };
            let (sink, source) = ws.split();
            let reader = spawn_ws_reader(source, shared.frame.clone(), inbound_tx);
            Socket::new(Arc::clone(shared), handle, WsWriter(sink))
                .run(inbound_rx, commands, shutdown)
                .await;
            reader.abort();
        }
        Protocol::Tcp => {
            let (read_half, write_half) = tokio::io::split(stream);
            let reader = spawn_tcp_reader(read_half, shared.frame.clone(), inbound_tx);
            Socket::new(Arc::clone(shared), handle, TcpWriter(write_half))
                .run(inbound_rx, commands, shutdown)
                .await;
            reader.abort();
        }
    }
}

/// Run `fut`, giving up after `window` if one is set. `None` means it timed out.
async fn within<F: Future>(window: Option<Duration>, fut: F) -> Option<F::Output> {
    match window {
        Some(window) => tokio::time::timeout(window, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Keep login statistics in step with session binds.
async fn track_logins(
    shared: Arc<ConnectorShared>,
    mut events: broadcast::Receiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Bound { session, uid }) => {
                    tracing::debug!("session on [{}] bind with uid: {uid}", shared.server_id);
                    let address = shared
                        .sessions
                        .client_address(session)
                        .await
                        .map(|addr| addr.to_string())
                        .unwrap_or_default();
                    shared.stats.add_logined_user(uid, address).await;
                }
                Ok(SessionEvent::Unbound { uid, .. }) => {
                    shared.stats.remove_logined_user(&uid).await;
                }
                Ok(SessionEvent::Closed { session, .. }) => {
                    if let Some(uid) = &session.uid {
                        shared.stats.remove_logined_user(uid).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("[{}] login tracking missed {missed} session events", shared.server_id);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
