//! Byte-stream plumbing under a socket: replaying sniffed bytes, reading
//! packets off raw TCP or WebSocket frames, and writing encoded packets back.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use skein_protocol::{FrameConfig, FrameError, Packet, decode, read_packet, write_packet_bytes};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

/// A stream that yields `prefix` before reading from `inner`.
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    /// Replay `prefix`, then continue with `inner`.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        let prefix = (!prefix.is_empty()).then_some(prefix);
        Self { prefix, inner }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Event delivered from a transport reader to its socket.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A complete packet.
    Packet(Packet),
    /// Unparseable input; the connection must be dropped.
    Invalid(String),
    /// The peer went away.
    Closed,
}

/// Outbound half of a transport.
#[async_trait]
pub(crate) trait PacketWriter: Send + 'static {
    /// Write one buffer of encoded packets.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Close the transport.
    async fn close(&mut self);
}

/// Raw framed TCP writer.
pub(crate) struct TcpWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> PacketWriter for TcpWriter<W> {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        write_packet_bytes(&mut self.0, bytes)
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

/// WebSocket writer; every write is one binary frame.
pub(crate) struct WsWriter<S>(pub SplitSink<WebSocketStream<S>, Message>);

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> PacketWriter for WsWriter<S> {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// Read packets off a raw byte stream until it closes or misbehaves.
pub(crate) fn spawn_tcp_reader<R>(
    mut reader: R,
    config: FrameConfig,
    tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = match read_packet(&mut reader, &config).await {
                Ok(packet) => Inbound::Packet(packet),
                Err(FrameError::ConnectionClosed) => Inbound::Closed,
                Err(FrameError::Io(e)) => {
                    tracing::debug!("tcp read failed: {e}");
                    Inbound::Closed
                }
                Err(e) => Inbound::Invalid(e.to_string()),
            };
            let last = !matches!(event, Inbound::Packet(_));
            if tx.send(event).await.is_err() || last {
                break;
            }
        }
    })
}

/// Read packets out of WebSocket frames. One frame may carry several packets.
pub(crate) fn spawn_ws_reader<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    config: FrameConfig,
    tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let data = match stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) | None => {
                    let _ = tx.send(Inbound::Closed).await;
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!("websocket read failed: {e}");
                    let _ = tx.send(Inbound::Closed).await;
                    break;
                }
            };

            match decode(&data) {
                Ok(packets) => {
                    for packet in packets {
                        if packet.body.len() > config.max_packet_size {
                            let _ = tx
                                .send(Inbound::Invalid(format!(
                                    "packet body size {} exceeds maximum {}",
                                    packet.body.len(),
                                    config.max_packet_size
                                )))
                                .await;
                            return;
                        }
                        if tx.send(Inbound::Packet(packet)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Inbound::Invalid(e.to_string())).await;
                    return;
                }
            }
        }
    })
}
