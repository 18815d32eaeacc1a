//! Wire protocol: packet framing, message framing, handshake bodies, and a
//! packet reader for byte streams.

pub mod handshake;
pub mod message;
pub mod packet;
pub mod reader;

pub use handshake::{
    CODE_OK, CODE_OLD_CLIENT, CODE_USE_ERROR, ClientSys, HandshakeRequest, HandshakeResponse,
    KickBody, ServerSys,
};
pub use message::{MAX_ROUTE_NAME_LEN, Message, MessageError, MessageKind, Route};
pub use packet::{
    HEADER_LEN, MAX_BODY_LEN, Packet, PacketError, PacketIter, PacketType, decode, decode_iter,
    encode, encode_batch,
};
pub use reader::{FrameConfig, FrameError, read_packet, write_packet_bytes};

/// Any error raised by the protocol codecs.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Packet layer.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Message layer.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Stream reader.
    #[error(transparent)]
    Frame(#[from] FrameError),
}
