//! Application message handling for decoded client messages.

use async_trait::async_trait;
use serde_json::{Map, Value};
use skein_protocol::MessageKind;
use skein_session::FrontendSession;

use crate::coder::DecodedMessage;

/// Failure returned by a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Description for logs.
    pub message: String,
    /// Optional response body sent to the client; `code` defaults to 500.
    pub body: Option<Value>,
}

impl HandlerError {
    /// Error without a response body.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            body: None,
        }
    }

    /// Error carrying a response body.
    pub fn with_body(message: impl Into<String>, body: Value) -> Self {
        Self {
            message: message.into(),
            body: Some(body),
        }
    }
}

/// Routes client requests and notifies to the application.
///
/// Calls for one connection are made one at a time, in arrival order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message. For requests, `Ok(Some(body))` is the response.
    async fn handle(
        &self,
        message: DecodedMessage,
        session: FrontendSession,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Response body to send for a handler result, or `None` when nothing goes
/// back to the client.
pub(crate) fn response_body(
    kind: MessageKind,
    route: &str,
    result: Result<Option<Value>, HandlerError>,
) -> Option<Value> {
    if kind != MessageKind::Request {
        if let Ok(Some(_)) = result {
            tracing::warn!("try to response to a notify: {route}");
        }
        return None;
    }

    match result {
        Ok(body) => Some(body.unwrap_or_else(|| Value::Object(Map::new()))),
        Err(err) => {
            tracing::debug!("handler for {route} failed: {err}");
            let mut body = err.body.unwrap_or_else(|| Value::Object(Map::new()));
            if let Value::Object(map) = &mut body
                && !map.contains_key("code")
            {
                map.insert("code".to_string(), Value::from(500));
            }
            Some(body)
        }
    }
}
