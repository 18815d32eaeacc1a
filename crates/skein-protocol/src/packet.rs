//! Outer packet framing.
//!
//! Every packet on the wire carries a 4-byte header:
//!
//! ```text
//! +--------+----------------------+------------------+
//! |  type  |  body length (3 B)   |       body       |
//! |   u8   |  u24 big-endian      |  (length bytes)  |
//! +--------+----------------------+------------------+
//! ```
//!
//! A DATA packet's body is a message frame (see [`crate::message`]). Messages
//! are encoded straight into a DATA packet buffer so that buffered pushes can
//! be coalesced with [`encode_batch`] without re-copying headers around.

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest body length expressible in the 24-bit length field.
pub const MAX_BODY_LEN: usize = 0x00FF_FFFF;

/// Packet type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client hello / server handshake response (JSON body).
    Handshake = 1,
    /// Client acknowledges the handshake response.
    HandshakeAck = 2,
    /// Bidirectional keep-alive, empty body.
    Heartbeat = 3,
    /// Application message frame.
    Data = 4,
    /// Server-initiated disconnect notice (JSON body).
    Kick = 5,
}

impl PacketType {
    /// Map a header byte to a packet type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Handshake),
            2 => Some(Self::HandshakeAck),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Data),
            5 => Some(Self::Kick),
            _ => None,
        }
    }

    /// The header byte for this type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Packet body (may be empty).
    pub body: Vec<u8>,
}

impl Packet {
    /// Build a packet from its parts.
    pub fn new(kind: PacketType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Encode this packet into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        encode(self.kind, &self.body)
    }
}

/// Errors raised by the packet codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// The header type byte is not a known [`PacketType`].
    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    /// The buffer ended inside a header or body.
    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish the packet.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// The body does not fit in the 24-bit length field.
    #[error("packet body of {0} bytes exceeds the 24-bit length field")]
    BodyTooLarge(usize),

    /// A batch entry is shorter than a packet header.
    #[error("batch entry of {0} bytes is missing its packet header")]
    MissingHeader(usize),
}

/// Write a packet header into the first four bytes of `dst`.
pub(crate) fn write_header(dst: &mut [u8], kind: PacketType, body_len: usize) {
    dst[0] = kind.as_u8();
    dst[1] = ((body_len >> 16) & 0xFF) as u8;
    dst[2] = ((body_len >> 8) & 0xFF) as u8;
    dst[3] = (body_len & 0xFF) as u8;
}

/// Read the 24-bit body length out of a header.
pub(crate) fn read_body_len(header: &[u8]) -> usize {
    ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize
}

/// Encode a single packet.
pub fn encode(kind: PacketType, body: &[u8]) -> Result<Vec<u8>, PacketError> {
    if body.len() > MAX_BODY_LEN {
        return Err(PacketError::BodyTooLarge(body.len()));
    }
    let mut out = vec![0u8; HEADER_LEN + body.len()];
    write_header(&mut out, kind, body.len());
    out[HEADER_LEN..].copy_from_slice(body);
    Ok(out)
}

/// Concatenate already-encoded DATA packets into one buffer.
///
/// Each entry must start with its 4-byte header; the header is rewritten in
/// place from the entry's actual length, so entries produced by
/// [`crate::message::Message::encode_data_packet`] can be batched as-is.
pub fn encode_batch<B: AsRef<[u8]>>(packets: &[B]) -> Result<Vec<u8>, PacketError> {
    let mut total = 0usize;
    for packet in packets {
        let len = packet.as_ref().len();
        if len < HEADER_LEN {
            return Err(PacketError::MissingHeader(len));
        }
        if len - HEADER_LEN > MAX_BODY_LEN {
            return Err(PacketError::BodyTooLarge(len - HEADER_LEN));
        }
        total += len;
    }

    let mut out = vec![0u8; total];
    let mut offset = 0;
    for packet in packets {
        let bytes = packet.as_ref();
        let body_len = bytes.len() - HEADER_LEN;
        write_header(&mut out[offset..], PacketType::Data, body_len);
        out[offset + HEADER_LEN..offset + bytes.len()].copy_from_slice(&bytes[HEADER_LEN..]);
        offset += bytes.len();
    }
    Ok(out)
}

/// Lazily decode a buffer into packets, in order.
///
/// Iteration stops after the first error; packets preceding a bad one are
/// still yielded so callers can dispatch them before reacting to the error.
pub fn decode_iter(buf: &[u8]) -> PacketIter<'_> {
    PacketIter {
        buf,
        offset: 0,
        failed: false,
    }
}

/// Decode a buffer holding one or more whole packets.
pub fn decode(buf: &[u8]) -> Result<Vec<Packet>, PacketError> {
    decode_iter(buf).collect()
}

/// Iterator returned by [`decode_iter`].
pub struct PacketIter<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl Iterator for PacketIter<'_> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let rest = &self.buf[self.offset..];
        if rest.len() < HEADER_LEN {
            self.failed = true;
            return Some(Err(PacketError::Truncated {
                needed: HEADER_LEN,
                available: rest.len(),
            }));
        }

        let Some(kind) = PacketType::from_u8(rest[0]) else {
            self.failed = true;
            return Some(Err(PacketError::UnknownType(rest[0])));
        };

        let body_len = read_body_len(rest);
        if rest.len() < HEADER_LEN + body_len {
            self.failed = true;
            return Some(Err(PacketError::Truncated {
                needed: HEADER_LEN + body_len,
                available: rest.len(),
            }));
        }

        let body = rest[HEADER_LEN..HEADER_LEN + body_len].to_vec();
        self.offset += HEADER_LEN + body_len;
        Some(Ok(Packet { kind, body }))
    }
}
