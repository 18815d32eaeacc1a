//! Seam for an external schema-based body codec.
//!
//! Bodies of routes with a registered schema are encoded by the codec instead
//! of JSON. The codec itself lives outside this crate.

use serde_json::Value;

/// Failure reported by a [`SchemaCodec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("schema codec: {0}")]
pub struct SchemaError(pub String);

/// A body codec keyed by route.
pub trait SchemaCodec: Send + Sync {
    /// Whether inbound bodies on `route` use a schema.
    fn has_client_schema(&self, route: &str) -> bool;

    /// Whether outbound bodies on `route` use a schema.
    fn has_server_schema(&self, route: &str) -> bool;

    /// Encode an outbound body.
    fn encode(&self, route: &str, body: &Value) -> Result<Vec<u8>, SchemaError>;

    /// Decode an inbound body.
    fn decode(&self, route: &str, bytes: &[u8]) -> Result<Value, SchemaError>;

    /// Version string clients cache to skip the schema download.
    fn version(&self) -> String;

    /// Schema definitions sent in the handshake response.
    fn protos(&self) -> Value;
}
