//! Reading packets off a byte stream.
//!
//! The raw TCP processor has no message boundaries of its own, so packets are
//! pulled one at a time: read the 4-byte header, check the declared length
//! against [`FrameConfig::max_packet_size`], then read exactly that many body
//! bytes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::packet::{HEADER_LEN, Packet, PacketType, read_body_len};

/// Configuration for the stream reader.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed packet body size in bytes. Default: 1 MiB.
    pub max_packet_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1_048_576,
        }
    }
}

/// Errors that can occur while reading packets from a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared body size exceeds the configured maximum.
    #[error("packet body size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared body size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The header type byte is not a known packet type.
    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    /// The peer closed the stream before a complete packet was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single packet from the stream.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the stream
/// before the packet is complete, including a clean close between packets.
pub async fn read_packet<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Packet, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(map_eof)?;

    let kind = PacketType::from_u8(header[0]).ok_or(FrameError::UnknownType(header[0]))?;
    let body_len = read_body_len(&header);
    if body_len > config.max_packet_size {
        return Err(FrameError::PayloadTooLarge {
            size: body_len,
            max: config.max_packet_size,
        });
    }

    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        reader.read_exact(&mut body).await.map_err(map_eof)?;
    }

    Ok(Packet { kind, body })
}

/// Write already-encoded packet bytes to the stream and flush.
pub async fn write_packet_bytes<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
