//! Per-connection state machine.
//!
//! A socket moves `Inited -> WaitAck -> Working -> Closed`. One task owns the
//! transport writer and consumes, in one `select!`, inbound packets from the
//! reader task, commands from the session layer, the shutdown signal and the
//! current deadline (handshake window, then heartbeat timeout).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use skein_protocol::{
    HandshakeRequest, HandshakeResponse, KickBody, Packet, PacketType, encode, encode_batch,
};
use skein_session::{SessionId, SessionSink};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use crate::coder::DecodedMessage;
use crate::connector::ConnectorShared;
use crate::handler::response_body;
use crate::handshake::HandshakeOutcome;
use crate::transport::{Inbound, PacketWriter};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Accepted, waiting for the client handshake.
    Inited,
    /// Handshake answered, waiting for the ack.
    WaitAck,
    /// Application traffic flows.
    Working,
    /// Terminal.
    Closed,
}

/// Request from the session layer to a socket task.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    Send(Bytes),
    SendBatch(Vec<Bytes>),
    Kick(String),
    Disconnect,
}

/// Cloneable handle to a live socket. Registered with the session registry as
/// the session's sink.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SessionId,
    remote: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub(crate) fn new(
        id: SessionId,
        remote: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, remote, tx }, rx)
    }

    /// Connection id, equal to the session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Close without a kick notice.
    pub fn disconnect(&self) {
        let _ = self.tx.send(SocketCommand::Disconnect);
    }
}

impl SessionSink for SocketHandle {
    fn send(&self, packet: Bytes) -> bool {
        self.tx.send(SocketCommand::Send(packet)).is_ok()
    }

    fn send_batch(&self, packets: Vec<Bytes>) -> bool {
        self.tx.send(SocketCommand::SendBatch(packets)).is_ok()
    }

    fn kick(&self, reason: &str) {
        let _ = self.tx.send(SocketCommand::Kick(reason.to_string()));
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

/// What the loop does after handling an event.
enum Flow {
    Continue,
    Close,
}

pub(crate) struct Socket<W> {
    id: SessionId,
    state: SocketState,
    writer: W,
    handle: SocketHandle,
    shared: Arc<ConnectorShared>,
    dispatch: Option<mpsc::UnboundedSender<DecodedMessage>>,
    deadline: Option<Instant>,
}

impl<W: PacketWriter> Socket<W> {
    pub(crate) fn new(shared: Arc<ConnectorShared>, handle: SocketHandle, writer: W) -> Self {
        Self {
            id: handle.id(),
            state: SocketState::Inited,
            writer,
            handle,
            shared,
            dispatch: None,
            deadline: None,
        }
    }

    /// Drive the connection until it closes.
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut commands: mpsc::UnboundedReceiver<SocketCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let window = self.shared.config.handshake_timeout();
        if !window.is_zero() {
            self.deadline = Some(Instant::now() + window);
        }

        loop {
            let deadline = self.deadline;
            let flow = tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        Flow::Close
                    } else {
                        Flow::Continue
                    }
                }
                event = inbound.recv() => match event {
                    Some(Inbound::Packet(packet)) => self.on_packet(packet).await,
                    Some(Inbound::Invalid(reason)) => {
                        tracing::error!("[{}] invalid data from connection {}: {reason}", self.shared.server_id, self.id);
                        Flow::Close
                    }
                    Some(Inbound::Closed) | None => Flow::Close,
                },
                Some(command) = commands.recv() => self.on_command(command).await,
                _ = sleep_until_deadline(deadline) => {
                    if self.state == SocketState::Working {
                        tracing::info!("[{}] client {} heartbeat timeout", self.shared.server_id, self.id);
                    } else {
                        tracing::warn!("[{}] connection {} did not finish the handshake in time", self.shared.server_id, self.id);
                    }
                    Flow::Close
                }
            };
            if matches!(flow, Flow::Close) {
                break;
            }
        }

        self.close().await;
    }

    async fn on_packet(&mut self, packet: Packet) -> Flow {
        match packet.kind {
            PacketType::Handshake => self.on_handshake(&packet.body).await,
            PacketType::HandshakeAck => {
                if self.state == SocketState::WaitAck {
                    self.state = SocketState::Working;
                    tracing::debug!("[{}] connection {} working", self.shared.server_id, self.id);
                    return self.heartbeat().await;
                }
                Flow::Continue
            }
            PacketType::Heartbeat => {
                if self.state == SocketState::Working {
                    return self.heartbeat().await;
                }
                Flow::Continue
            }
            PacketType::Data => {
                if self.state == SocketState::Working {
                    self.arm_heartbeat_timeout();
                    self.on_data(&packet.body);
                } else {
                    tracing::debug!("[{}] dropped data from connection {} before handshake", self.shared.server_id, self.id);
                }
                Flow::Continue
            }
            PacketType::Kick => {
                tracing::error!("[{}] could not handle kick packet from connection {}", self.shared.server_id, self.id);
                Flow::Close
            }
        }
    }

    async fn on_handshake(&mut self, body: &[u8]) -> Flow {
        if self.state != SocketState::Inited {
            return Flow::Continue;
        }

        let request = HandshakeRequest::parse(body);
        match self.shared.handshake.handle(&request, self.id).await {
            HandshakeOutcome::Accepted(response) => {
                self.shared
                    .sessions
                    .create(
                        self.id,
                        self.shared.server_id.clone(),
                        Arc::new(self.handle.clone()),
                    )
                    .await;
                if self.write_response(&response).await.is_err() {
                    return Flow::Close;
                }
                self.state = SocketState::WaitAck;
                Flow::Continue
            }
            HandshakeOutcome::Rejected(code) => {
                tracing::info!("[{}] handshake of connection {} rejected with code {code}", self.shared.server_id, self.id);
                let _ = self.write_response(&HandshakeResponse::error(code)).await;
                tokio::task::yield_now().await;
                Flow::Close
            }
        }
    }

    async fn write_response(&mut self, response: &HandshakeResponse) -> std::io::Result<()> {
        let bytes = response.to_packet().map_err(std::io::Error::other)?;
        self.writer.write(&bytes).await
    }

    /// Answer a heartbeat and restart the inbound timeout.
    async fn heartbeat(&mut self) -> Flow {
        if self.shared.config.heartbeat().is_none() {
            self.deadline = None;
            return Flow::Continue;
        }
        let flow = match encode(PacketType::Heartbeat, &[]) {
            Ok(bytes) => self.write(&bytes).await,
            Err(_) => Flow::Continue,
        };
        self.arm_heartbeat_timeout();
        flow
    }

    fn arm_heartbeat_timeout(&mut self) {
        self.deadline = self
            .shared
            .config
            .heartbeat_timeout()
            .map(|timeout| Instant::now() + timeout);
    }

    fn on_data(&mut self, body: &[u8]) {
        let message = match self.shared.coder.decode(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("[{}] discard message from connection {}: {e}", self.shared.server_id, self.id);
                return;
            }
        };
        if message.server_type().is_none() {
            tracing::error!("invalid route string. route : {}", message.route);
            return;
        }

        let dispatch = self.dispatch.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(dispatch_loop(Arc::clone(&self.shared), self.id, rx));
            tx
        });
        let _ = dispatch.send(message);
    }

    async fn on_command(&mut self, command: SocketCommand) -> Flow {
        match command {
            SocketCommand::Send(packet) => {
                if self.state != SocketState::Working {
                    tracing::debug!("[{}] drop push to connection {} in state {:?}", self.shared.server_id, self.id, self.state);
                    return Flow::Continue;
                }
                self.write(&packet).await
            }
            SocketCommand::SendBatch(packets) => {
                if self.state != SocketState::Working {
                    return Flow::Continue;
                }
                match encode_batch(&packets) {
                    Ok(bytes) => self.write(&bytes).await,
                    Err(e) => {
                        tracing::error!("[{}] fail to batch messages for connection {}: {e}", self.shared.server_id, self.id);
                        Flow::Continue
                    }
                }
            }
            SocketCommand::Kick(reason) => {
                if let Ok(bytes) = KickBody::new(reason).to_packet() {
                    let _ = self.writer.write(&bytes).await;
                }
                tokio::task::yield_now().await;
                Flow::Close
            }
            SocketCommand::Disconnect => Flow::Close,
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Flow {
        match self.writer.write(bytes).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::debug!("[{}] write to connection {} failed: {e}", self.shared.server_id, self.id);
                Flow::Close
            }
        }
    }

    async fn close(mut self) {
        self.state = SocketState::Closed;
        self.dispatch = None;
        self.writer.close().await;
        self.shared.sessions.remove(self.id).await;
        tracing::debug!("[{}] connection {} closed", self.shared.server_id, self.id);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Hand one connection's messages to the application, in order.
async fn dispatch_loop(
    shared: Arc<ConnectorShared>,
    sid: SessionId,
    mut messages: mpsc::UnboundedReceiver<DecodedMessage>,
) {
    while let Some(message) = messages.recv().await {
        let Some(session) = shared.sessions.get(sid).await else {
            break;
        };
        let kind = message.kind;
        let id = message.id;
        let route = message.route.clone();

        let result = shared.handler.handle(message, session).await;
        let (Some(body), Some(id)) = (response_body(kind, &route, result), id) else {
            continue;
        };
        if let Err(e) = shared.respond(sid, id, &route, &body).await {
            tracing::error!("[{}] fail to respond to {route} on session {sid}: {e}", shared.server_id);
        }
    }
}
