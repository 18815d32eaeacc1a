//! Application-level message coding.
//!
//! `encode` turns `(id?, route, body)` into a ready-to-send DATA packet and
//! `decode` turns a DATA packet body into a routed, parsed message. Route
//! compression goes through the [`RouteDictionary`]; bodies go through the
//! [`SchemaCodec`] when the route has a schema, JSON otherwise.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use skein_protocol::{Message, MessageKind, Route};

use crate::dictionary::RouteDictionary;
use crate::error::CoderError;
use crate::schema::SchemaCodec;

/// A client message after route resolution and body parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Request or notify.
    pub kind: MessageKind,
    /// Request id, for requests.
    pub id: Option<u64>,
    /// Resolved route string.
    pub route: String,
    /// Parsed body. An unparsable JSON body becomes an empty object.
    pub body: Value,
}

impl DecodedMessage {
    /// Server type prefix of the route (`connector` in `connector.entryHandler.enter`).
    pub fn server_type(&self) -> Option<&str> {
        self.route.split_once('.').map(|(server_type, _)| server_type)
    }
}

/// Message coder shared by every connection of a connector.
#[derive(Clone, Default)]
pub struct Coder {
    dictionary: Option<Arc<RouteDictionary>>,
    schema: Option<Arc<dyn SchemaCodec>>,
}

impl Coder {
    /// `dictionary` enables route compression, `schema` enables schema bodies.
    pub fn new(
        dictionary: Option<Arc<RouteDictionary>>,
        schema: Option<Arc<dyn SchemaCodec>>,
    ) -> Self {
        Self { dictionary, schema }
    }

    /// The active dictionary, if route compression is on.
    pub fn dictionary(&self) -> Option<&Arc<RouteDictionary>> {
        self.dictionary.as_ref()
    }

    /// The active schema codec, if schema bodies are on.
    pub fn schema(&self) -> Option<&Arc<dyn SchemaCodec>> {
        self.schema.as_ref()
    }

    /// Encode a response (when `id` is set) or a push into a DATA packet.
    ///
    /// `route` selects the body codec in both cases; only pushes carry it on
    /// the wire.
    pub fn encode(&self, id: Option<u64>, route: &str, body: &Value) -> Result<Bytes, CoderError> {
        let payload = self.encode_body(route, body)?;
        let message = match id {
            Some(id) => Message::response(id, payload),
            None => {
                let route = match self.dictionary.as_ref().and_then(|d| d.code_of(route)) {
                    Some(code) => Route::Code(code),
                    None => Route::Name(route.to_string()),
                };
                Message::push(route, payload)
            }
        };
        Ok(Bytes::from(message.encode_data_packet()?))
    }

    fn encode_body(&self, route: &str, body: &Value) -> Result<Vec<u8>, CoderError> {
        match &self.schema {
            Some(schema) if schema.has_server_schema(route) => Ok(schema.encode(route, body)?),
            _ => Ok(serde_json::to_vec(body)?),
        }
    }

    /// Decode the body of a DATA packet.
    pub fn decode(&self, data: &[u8]) -> Result<DecodedMessage, CoderError> {
        let message = Message::decode(data)?;
        let route = match message.route {
            Some(Route::Name(name)) => name,
            Some(Route::Code(code)) => {
                let dictionary = self
                    .dictionary
                    .as_ref()
                    .ok_or(CoderError::DictionaryDisabled(code))?;
                dictionary
                    .route_of(code)
                    .ok_or(CoderError::UnknownRouteCode(code))?
                    .to_string()
            }
            None => return Err(CoderError::MissingRoute),
        };

        let body = match &self.schema {
            Some(schema) if schema.has_client_schema(&route) => {
                schema.decode(&route, &message.body)?
            }
            _ => serde_json::from_slice(&message.body)
                .unwrap_or_else(|_| Value::Object(Map::new())),
        };

        Ok(DecodedMessage {
            kind: message.kind,
            id: message.id,
            route,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaError;
    use serde_json::json;
    use skein_protocol::{PacketType, decode};

    fn dictionary() -> Arc<RouteDictionary> {
        Arc::new(
            RouteDictionary::new(
                vec!["chat.chatHandler.send".to_string()],
                vec!["onChat".to_string()],
            )
            .unwrap(),
        )
    }

    fn frame(packet: &[u8]) -> Message {
        let packets = decode(packet).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::Data);
        Message::decode(&packets[0].body).unwrap()
    }

    /// Uppercases a `text` field on the wire so tests can see it was used.
    struct UpperCodec;

    impl SchemaCodec for UpperCodec {
        fn has_client_schema(&self, route: &str) -> bool {
            route == "chat.chatHandler.send"
        }

        fn has_server_schema(&self, route: &str) -> bool {
            route == "onChat"
        }

        fn encode(&self, _route: &str, body: &Value) -> Result<Vec<u8>, SchemaError> {
            let text = body["text"]
                .as_str()
                .ok_or_else(|| SchemaError("missing text".into()))?;
            Ok(text.to_uppercase().into_bytes())
        }

        fn decode(&self, _route: &str, bytes: &[u8]) -> Result<Value, SchemaError> {
            let text = std::str::from_utf8(bytes).map_err(|e| SchemaError(e.to_string()))?;
            Ok(json!({ "text": text.to_lowercase() }))
        }

        fn version(&self) -> String {
            "v1".into()
        }

        fn protos(&self) -> Value {
            json!({})
        }
    }

    #[test]
    fn test_encode_push_compresses_known_route() {
        let coder = Coder::new(Some(dictionary()), None);
        let msg = frame(&coder.encode(None, "onChat", &json!({"a": 1})).unwrap());
        assert_eq!(msg.kind, MessageKind::Push);
        assert_eq!(msg.route, Some(Route::Code(2)));
        assert_eq!(serde_json::from_slice::<Value>(&msg.body).unwrap(), json!({"a": 1}));

        let msg = frame(&coder.encode(None, "onOther", &json!({})).unwrap());
        assert_eq!(msg.route, Some(Route::Name("onOther".into())));
    }

    #[test]
    fn test_encode_response_has_id_and_no_route() {
        let coder = Coder::default();
        let msg = frame(&coder.encode(Some(300), "chat.chatHandler.send", &json!({"code": 200})).unwrap());
        assert_eq!(msg.kind, MessageKind::Response);
        assert_eq!(msg.id, Some(300));
        assert_eq!(msg.route, None);
    }

    #[test]
    fn test_decode_resolves_code_through_dictionary() {
        let coder = Coder::new(Some(dictionary()), None);
        let raw = Message::request(5, Route::Code(1), br#"{"text":"hi"}"#.to_vec())
            .encode()
            .unwrap();
        let decoded = coder.decode(&raw).unwrap();
        assert_eq!(decoded.route, "chat.chatHandler.send");
        assert_eq!(decoded.id, Some(5));
        assert_eq!(decoded.server_type(), Some("chat"));
        assert_eq!(decoded.body, json!({"text": "hi"}));
    }

    #[test]
    fn test_decode_unknown_code_is_an_error() {
        let coder = Coder::new(Some(dictionary()), None);
        let raw = Message::notify(Route::Code(77), b"{}".to_vec()).encode().unwrap();
        assert!(matches!(coder.decode(&raw), Err(CoderError::UnknownRouteCode(77))));

        let coder = Coder::default();
        assert!(matches!(coder.decode(&raw), Err(CoderError::DictionaryDisabled(77))));
    }

    #[test]
    fn test_decode_bad_json_body_becomes_empty_object() {
        let coder = Coder::default();
        let raw = Message::notify("area.playerHandler.move", b"not json".to_vec())
            .encode()
            .unwrap();
        assert_eq!(coder.decode(&raw).unwrap().body, json!({}));
    }

    #[test]
    fn test_decode_routeless_frame_is_rejected() {
        let coder = Coder::default();
        let raw = Message::response(1, b"{}".to_vec()).encode().unwrap();
        assert!(matches!(coder.decode(&raw), Err(CoderError::MissingRoute)));
    }

    #[test]
    fn test_schema_codec_used_per_route() {
        let coder = Coder::new(None, Some(Arc::new(UpperCodec)));

        let msg = frame(&coder.encode(None, "onChat", &json!({"text": "hey"})).unwrap());
        assert_eq!(msg.body, b"HEY");

        let raw = Message::request(1, "chat.chatHandler.send", b"LOUD".to_vec())
            .encode()
            .unwrap();
        assert_eq!(coder.decode(&raw).unwrap().body, json!({"text": "loud"}));

        assert!(matches!(
            coder.encode(None, "onChat", &json!({})),
            Err(CoderError::Schema(_))
        ));
    }
}
