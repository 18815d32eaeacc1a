//! Protocol detection on a freshly accepted connection.
//!
//! The first bytes decide the processor: an HTTP method token means a
//! WebSocket upgrade request, anything else is raw framed TCP. The bytes read
//! while deciding are handed back through [`Rewind`] so the chosen processor
//! sees the stream from its first byte.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::transport::Rewind;

/// Tokens that mark an HTTP request.
const HTTP_METHODS: [&[u8]; 5] = [b"GET", b"POST", b"DELETE", b"PUT", b"HEAD"];

/// Bytes of a method token compared against the stream head.
const SNIFF_LEN: usize = 4;

const SNIFF_CHUNK: usize = 1024;

/// Processor selected for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// HTTP upgrade to WebSocket.
    WebSocket,
    /// Raw framed packets.
    Tcp,
}

/// Classify the head of a stream. `None` means more bytes are needed.
pub fn classify(head: &[u8]) -> Option<Protocol> {
    let head = &head[..head.len().min(SNIFF_LEN)];
    let mut undecided = false;
    for method in HTTP_METHODS {
        let token = &method[..method.len().min(SNIFF_LEN)];
        if head.len() >= token.len() {
            if head.starts_with(token) {
                return Some(Protocol::WebSocket);
            }
        } else if token.starts_with(head) {
            undecided = true;
        }
    }
    if undecided { None } else { Some(Protocol::Tcp) }
}

/// Read until the protocol is known.
///
/// Returns the protocol and the stream rewound to its first byte. A peer that
/// closes before a decision is an [`io::ErrorKind::UnexpectedEof`] error.
pub async fn sniff<S>(mut stream: S) -> io::Result<(Protocol, Rewind<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut head = BytesMut::with_capacity(SNIFF_CHUNK);
    loop {
        if stream.read_buf(&mut head).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if let Some(protocol) = classify(&head) {
            return Ok((protocol, Rewind::new(head.freeze(), stream)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[test]
    fn test_http_methods_select_websocket() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), Some(Protocol::WebSocket));
        assert_eq!(classify(b"POST /x"), Some(Protocol::WebSocket));
        assert_eq!(classify(b"DELETE /x"), Some(Protocol::WebSocket));
        assert_eq!(classify(b"PUT /"), Some(Protocol::WebSocket));
        assert_eq!(classify(b"HEAD /"), Some(Protocol::WebSocket));
    }

    #[test]
    fn test_packet_header_selects_tcp() {
        assert_eq!(classify(&[1, 0, 0, 2, b'{', b'}']), Some(Protocol::Tcp));
        assert_eq!(classify(b"GOT"), Some(Protocol::Tcp));
    }

    #[test]
    fn test_partial_method_waits() {
        assert_eq!(classify(b"G"), None);
        assert_eq!(classify(b"PO"), None);
        assert_eq!(classify(b"P"), None);
        assert_eq!(classify(b"GE"), None);
    }

    #[tokio::test]
    async fn test_sniff_keeps_consumed_bytes() {
        let (mut client, server) = duplex(64);
        client.write_all(b"GE").await.unwrap();
        let sniffing = tokio::spawn(sniff(server));
        tokio::task::yield_now().await;
        client.write_all(b"T / HTTP/1.1").await.unwrap();
        drop(client);

        let (protocol, mut stream) = sniffing.await.unwrap().unwrap();
        assert_eq!(protocol, Protocol::WebSocket);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn test_sniff_eof_is_an_error() {
        let (client, server) = duplex(64);
        drop(client);
        let err = sniff(server).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
