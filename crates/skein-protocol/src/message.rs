//! Message framing, carried inside the body of a DATA packet.
//!
//! ```text
//! +--------+----------------+-------------------------+-----------+
//! |  flag  |  id (varint)   |  route                  |  body     |
//! |  1 B   |  REQUEST and   |  REQUEST, NOTIFY, PUSH  |  rest of  |
//! |        |  RESPONSE only |  code: u16 BE           |  frame    |
//! |        |                |  name: u8 len + bytes   |           |
//! +--------+----------------+-------------------------+-----------+
//! ```
//!
//! Flag bits: bit 0 = compressed route, bits 3..1 = kind, bit 4 = gzip.
//! The id is base-128, least significant group first, with the high bit of
//! each byte marking a continuation.

use crate::packet::{HEADER_LEN, MAX_BODY_LEN, PacketType, write_header};

const FLAG_COMPRESSED_ROUTE: u8 = 0x01;
const FLAG_GZIP: u8 = 0x10;
const KIND_SHIFT: u8 = 1;
const KIND_MASK: u8 = 0x07;

/// Longest route name accepted by the one-byte length prefix.
pub const MAX_ROUTE_NAME_LEN: usize = 255;

/// Longest varint accepted for a 64-bit id.
const MAX_ID_BYTES: usize = 10;

/// Message kind, stored in bits 3..1 of the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Client request expecting a response.
    Request = 0,
    /// Client notification, no response.
    Notify = 1,
    /// Server reply to a request.
    Response = 2,
    /// Server-initiated push.
    Push = 3,
}

impl MessageKind {
    /// Map the kind bits to a kind.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Request),
            1 => Some(Self::Notify),
            2 => Some(Self::Response),
            3 => Some(Self::Push),
            _ => None,
        }
    }

    /// Whether frames of this kind carry an id.
    pub fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }

    /// Whether frames of this kind carry a route.
    pub fn has_route(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }
}

/// A message route, either spelled out or compressed to a dictionary code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Route string, at most [`MAX_ROUTE_NAME_LEN`] bytes.
    Name(String),
    /// 16-bit dictionary code.
    Code(u16),
}

impl Route {
    /// Whether this route sets the compressed-route flag.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Route::Code(_))
    }

    fn encoded_len(&self) -> Result<usize, MessageError> {
        match self {
            Route::Code(_) => Ok(2),
            Route::Name(name) => {
                if name.len() > MAX_ROUTE_NAME_LEN {
                    return Err(MessageError::RouteTooLong(name.len()));
                }
                Ok(1 + name.len())
            }
        }
    }
}

impl From<&str> for Route {
    fn from(name: &str) -> Self {
        Route::Name(name.to_string())
    }
}

/// An application message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Request/response id; present iff `kind.has_id()`.
    pub id: Option<u64>,
    /// Route; present iff `kind.has_route()`.
    pub route: Option<Route>,
    /// Gzip flag, carried but not interpreted.
    pub gzip: bool,
    /// Body payload.
    pub body: Vec<u8>,
}

/// Errors raised by the message codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The frame is empty or ends inside the id or route.
    #[error("truncated message frame")]
    Truncated,

    /// Flag bits name a kind outside 0..=3.
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// The id varint does not fit in 64 bits.
    #[error("message id overflows 64 bits")]
    IdOverflow,

    /// A kind that carries an id was given none.
    #[error("message kind requires an id")]
    MissingId,

    /// A kind that carries a route was given none.
    #[error("{0:?} message requires a route")]
    MissingRoute(MessageKind),

    /// Route names are limited to 255 bytes.
    #[error("route name of {0} bytes exceeds 255")]
    RouteTooLong(usize),

    /// A decoded route name is not valid UTF-8.
    #[error("route name is not valid UTF-8")]
    InvalidRouteName,

    /// The encoded frame does not fit in a DATA packet.
    #[error("message frame of {0} bytes exceeds the packet length field")]
    FrameTooLarge(usize),
}

impl Message {
    /// A client request.
    pub fn request(id: u64, route: impl Into<Route>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Request,
            id: Some(id),
            route: Some(route.into()),
            gzip: false,
            body: body.into(),
        }
    }

    /// A client notification.
    pub fn notify(route: impl Into<Route>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Notify,
            id: None,
            route: Some(route.into()),
            gzip: false,
            body: body.into(),
        }
    }

    /// A server response to request `id`.
    pub fn response(id: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Response,
            id: Some(id),
            route: None,
            gzip: false,
            body: body.into(),
        }
    }

    /// A server push.
    pub fn push(route: impl Into<Route>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Push,
            id: None,
            route: Some(route.into()),
            gzip: false,
            body: body.into(),
        }
    }

    /// Exact size of the encoded frame.
    pub fn encoded_len(&self) -> Result<usize, MessageError> {
        let mut len = 1;
        if self.kind.has_id() {
            let id = self.id.ok_or(MessageError::MissingId)?;
            len += varint_len(id);
        }
        if self.kind.has_route() {
            let route = self
                .route
                .as_ref()
                .ok_or(MessageError::MissingRoute(self.kind))?;
            len += route.encoded_len()?;
        }
        Ok(len + self.body.len())
    }

    /// Encode the bare message frame.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let len = self.encoded_len()?;
        let mut out = Vec::with_capacity(len);
        self.write_frame(&mut out);
        debug_assert_eq!(out.len(), len);
        Ok(out)
    }

    /// Encode the frame wrapped in a DATA packet, in one allocation.
    pub fn encode_data_packet(&self) -> Result<Vec<u8>, MessageError> {
        let len = self.encoded_len()?;
        if len > MAX_BODY_LEN {
            return Err(MessageError::FrameTooLarge(len));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + len);
        out.resize(HEADER_LEN, 0);
        write_header(&mut out, PacketType::Data, len);
        self.write_frame(&mut out);
        Ok(out)
    }

    fn write_frame(&self, out: &mut Vec<u8>) {
        let compressed = self
            .route
            .as_ref()
            .is_some_and(|r| self.kind.has_route() && r.is_compressed());

        let mut flag = (self.kind as u8) << KIND_SHIFT;
        if compressed {
            flag |= FLAG_COMPRESSED_ROUTE;
        }
        if self.gzip {
            flag |= FLAG_GZIP;
        }
        out.push(flag);

        if self.kind.has_id()
            && let Some(id) = self.id
        {
            write_varint(out, id);
        }

        if self.kind.has_route()
            && let Some(route) = &self.route
        {
            match route {
                Route::Code(code) => out.extend_from_slice(&code.to_be_bytes()),
                Route::Name(name) => {
                    out.push(name.len() as u8);
                    out.extend_from_slice(name.as_bytes());
                }
            }
        }

        out.extend_from_slice(&self.body);
    }

    /// Decode a message frame (the body of a DATA packet).
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let (&flag, mut rest) = buf.split_first().ok_or(MessageError::Truncated)?;

        let kind_bits = (flag >> KIND_SHIFT) & KIND_MASK;
        let kind = MessageKind::from_bits(kind_bits).ok_or(MessageError::UnknownKind(kind_bits))?;
        let compressed = flag & FLAG_COMPRESSED_ROUTE != 0;
        let gzip = flag & FLAG_GZIP != 0;

        let id = if kind.has_id() {
            let (id, used) = read_varint(rest)?;
            rest = &rest[used..];
            Some(id)
        } else {
            None
        };

        let route = if kind.has_route() {
            if compressed {
                if rest.len() < 2 {
                    return Err(MessageError::Truncated);
                }
                let code = u16::from_be_bytes([rest[0], rest[1]]);
                rest = &rest[2..];
                Some(Route::Code(code))
            } else {
                let (&len, tail) = rest.split_first().ok_or(MessageError::Truncated)?;
                let len = len as usize;
                if tail.len() < len {
                    return Err(MessageError::Truncated);
                }
                let name = std::str::from_utf8(&tail[..len])
                    .map_err(|_| MessageError::InvalidRouteName)?
                    .to_string();
                rest = &tail[len..];
                Some(Route::Name(name))
            }
        } else {
            None
        };

        Ok(Self {
            kind,
            id,
            route,
            gzip,
            body: rest.to_vec(),
        })
    }
}

/// Number of bytes needed to encode `id` as a base-128 varint.
pub fn varint_len(mut id: u64) -> usize {
    let mut len = 1;
    while id >= 0x80 {
        id >>= 7;
        len += 1;
    }
    len
}

fn write_varint(out: &mut Vec<u8>, mut id: u64) {
    loop {
        let low = (id & 0x7F) as u8;
        id >>= 7;
        if id == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

fn read_varint(buf: &[u8]) -> Result<(u64, usize), MessageError> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_ID_BYTES {
            return Err(MessageError::IdOverflow);
        }
        let group = (byte & 0x7F) as u64;
        let shift = 7 * i as u32;
        if shift == 63 && group > 1 {
            return Err(MessageError::IdOverflow);
        }
        value |= group << shift;
        if byte < 0x80 {
            return Ok((value, i + 1));
        }
    }
    Err(MessageError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;

    #[test]
    fn test_varint_byte_count_transitions() {
        for (id, bytes) in [(0u64, 1), (127, 1), (128, 2), (16383, 2), (16384, 3)] {
            assert_eq!(varint_len(id), bytes, "id {id}");
            let msg = Message::response(id, b"x".to_vec());
            let encoded = msg.encode().unwrap();
            assert_eq!(encoded.len(), 1 + bytes + 1, "id {id}");
            assert_eq!(Message::decode(&encoded).unwrap(), msg, "id {id}");
        }
    }

    #[test]
    fn test_varint_is_little_endian_base_128() {
        let encoded = Message::response(300, Vec::new()).encode().unwrap();
        // 300 = 0b10_0101100 -> 0xAC 0x02
        assert_eq!(encoded, vec![2 << 1, 0xAC, 0x02]);
    }

    #[test]
    fn test_u64_max_id_round_trips() {
        let msg = Message::request(u64::MAX, "a.b.c", Vec::new());
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let mut frame = vec![0u8];
        frame.extend([0xFF; 11]);
        assert_eq!(Message::decode(&frame), Err(MessageError::IdOverflow));
    }

    #[test]
    fn test_flag_layout() {
        let push = Message::push(Route::Code(7), Vec::new()).encode().unwrap();
        assert_eq!(push[0], (3 << 1) | 0x01);

        let mut notify = Message::notify("chat.say", Vec::new());
        notify.gzip = true;
        assert_eq!(notify.encode().unwrap()[0], (1 << 1) | 0x10);
    }

    #[test]
    fn test_compressed_route_is_two_bytes_big_endian() {
        let encoded = Message::push(Route::Code(0x1234), b"{}".to_vec())
            .encode()
            .unwrap();
        assert_eq!(encoded, vec![0x07, 0x12, 0x34, b'{', b'}']);
    }

    #[test]
    fn test_named_route_is_length_prefixed() {
        let encoded = Message::notify("a.b", b"!".to_vec()).encode().unwrap();
        assert_eq!(encoded, vec![0x02, 3, b'a', b'.', b'b', b'!']);
    }

    #[test]
    fn test_every_kind_round_trips() {
        let messages = [
            Message::request(5, "connector.entry.enter", b"{\"a\":1}".to_vec()),
            Message::request(16384, Route::Code(3), Vec::new()),
            Message::notify("area.move", b"xyz".to_vec()),
            Message::notify(Route::Code(0xFFFF), Vec::new()),
            Message::response(128, b"ok".to_vec()),
            Message::push("onChat", b"hello".to_vec()),
            Message::push(Route::Code(0), Vec::new()),
        ];
        for msg in messages {
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_route_name_length_limit() {
        let ok = "r".repeat(255);
        assert!(Message::push(ok.as_str(), Vec::new()).encode().is_ok());

        let too_long = "r".repeat(256);
        assert_eq!(
            Message::push(too_long.as_str(), Vec::new()).encode(),
            Err(MessageError::RouteTooLong(256))
        );
    }

    #[test]
    fn test_missing_parts_rejected_on_encode() {
        let mut msg = Message::response(1, Vec::new());
        msg.id = None;
        assert_eq!(msg.encode(), Err(MessageError::MissingId));

        let mut msg = Message::push("x", Vec::new());
        msg.route = None;
        assert_eq!(
            msg.encode(),
            Err(MessageError::MissingRoute(MessageKind::Push))
        );
    }

    #[test]
    fn test_decode_never_reads_past_frame() {
        assert_eq!(Message::decode(&[]), Err(MessageError::Truncated));
        // request whose id never terminates
        assert_eq!(Message::decode(&[0x00, 0x80]), Err(MessageError::Truncated));
        // compressed push with one route byte
        assert_eq!(Message::decode(&[0x07, 0x01]), Err(MessageError::Truncated));
        // named notify claiming 9 route bytes
        assert_eq!(
            Message::decode(&[0x02, 9, b'a']),
            Err(MessageError::Truncated)
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(
            Message::decode(&[5 << 1]),
            Err(MessageError::UnknownKind(5))
        );
    }

    #[test]
    fn test_data_packet_wraps_frame() {
        let msg = Message::push("onAdd", b"{}".to_vec());
        let packet_bytes = msg.encode_data_packet().unwrap();
        let frame = msg.encode().unwrap();

        assert_eq!(packet_bytes[0], PacketType::Data.as_u8());
        assert_eq!(&packet_bytes[HEADER_LEN..], frame.as_slice());

        let packets = packet::decode(&packet_bytes).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(Message::decode(&packets[0].body).unwrap(), msg);
    }

    #[test]
    fn test_batched_pushes_decode_in_order() {
        let first = Message::push("onA", b"1".to_vec());
        let second = Message::push(Route::Code(9), b"2".to_vec());
        let batch = packet::encode_batch(&[
            first.encode_data_packet().unwrap(),
            second.encode_data_packet().unwrap(),
        ])
        .unwrap();

        let decoded: Vec<Message> = packet::decode(&batch)
            .unwrap()
            .iter()
            .map(|p| Message::decode(&p.body).unwrap())
            .collect();
        assert_eq!(decoded, vec![first, second]);
    }
}
