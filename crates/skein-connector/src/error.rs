//! Connector error types.

use skein_protocol::MessageError;
use skein_push::ScheduleError;

use crate::schema::SchemaError;

/// Errors raised while turning application messages into wire bytes and back.
#[derive(Debug, thiserror::Error)]
pub enum CoderError {
    /// Message framing failed.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// A compressed route arrived but route compression is off.
    #[error("compressed route {0} received but the dictionary is disabled")]
    DictionaryDisabled(u16),

    /// A compressed route code has no dictionary entry.
    #[error("no route for dictionary code {0}")]
    UnknownRouteCode(u16),

    /// A request, notify or push frame has no route.
    #[error("message has no route")]
    MissingRoute,

    /// The schema codec rejected the body.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The body could not be serialised as JSON.
    #[error("failed to encode body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Errors raised by the connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Listener or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding an outbound message failed.
    #[error(transparent)]
    Coder(#[from] CoderError),

    /// The push scheduler refused the message.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The route dictionary could not be built.
    #[error(transparent)]
    Dictionary(#[from] crate::dictionary::DictionaryError),
}
