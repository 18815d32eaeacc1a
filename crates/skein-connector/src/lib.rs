//! Client-facing connector.
//!
//! Accepts raw TCP and WebSocket clients on one port, runs the handshake and
//! heartbeat state machine per connection, decodes application messages for
//! a [`MessageHandler`], and writes responses and pushes through a
//! [`skein_push::PushScheduler`].

pub mod coder;
pub mod connector;
pub mod dictionary;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod schema;
pub mod socket;
pub mod switcher;
pub mod transport;

pub use coder::{Coder, DecodedMessage};
pub use connector::{Connector, ConnectorBuilder, IdGenerator};
pub use dictionary::{DictionaryError, RouteDictionary};
pub use error::{CoderError, ConnectorError};
pub use handler::{HandlerError, MessageHandler};
pub use handshake::{ClientCheck, HandshakeCommand, HandshakeHook, HandshakeOutcome};
pub use schema::{SchemaCodec, SchemaError};
pub use socket::{SocketHandle, SocketState};
pub use switcher::{Protocol, classify, sniff};
pub use transport::Rewind;
