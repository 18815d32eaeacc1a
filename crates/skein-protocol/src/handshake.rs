//! JSON bodies carried by HANDSHAKE and KICK packets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::packet::{self, PacketError, PacketType};

/// Handshake accepted.
pub const CODE_OK: u16 = 200;
/// Handshake rejected by a missing `sys` block or the user hook.
pub const CODE_USE_ERROR: u16 = 500;
/// Client type/version rejected.
pub const CODE_OLD_CLIENT: u16 = 501;

/// Client side `sys` block of a handshake request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSys {
    /// Client platform type, e.g. `js-websocket`.
    #[serde(rename = "type", default)]
    pub client_type: String,
    /// Client library version.
    #[serde(default)]
    pub version: String,
    /// Route dictionary version cached by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dict_version: Option<String>,
    /// Schema version cached by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto_version: Option<String>,
    /// Client public key. Accepted and ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa: Option<Value>,
}

/// Handshake request body sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol negotiation block. Absent means the request is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys: Option<ClientSys>,
    /// Application payload passed through to the user hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

impl HandshakeRequest {
    /// Parse a handshake body leniently.
    ///
    /// A body that is not valid JSON, or whose `sys` block has the wrong
    /// shape, parses as a request without `sys`.
    pub fn parse(body: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        let user = value.get("user").cloned();
        let sys = value
            .get("sys")
            .and_then(|sys| serde_json::from_value::<ClientSys>(sys.clone()).ok());
        Self { sys, user }
    }
}

/// Server side `sys` block of a handshake response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSys {
    /// Heartbeat interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u64>,
    /// Route to code table (legacy name for `routeToCode`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dict: Option<BTreeMap<String, u16>>,
    /// Route to code table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_to_code: Option<BTreeMap<String, u16>>,
    /// Code to route table, keyed by the decimal code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_to_route: Option<BTreeMap<String, String>>,
    /// Current dictionary version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dict_version: Option<String>,
    /// Whether route compression is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_dict: Option<bool>,
    /// Schema definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protos: Option<Value>,
    /// Whether schema bodies are active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_proto: Option<bool>,
}

/// Handshake response body sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Result code.
    pub code: u16,
    /// Negotiated parameters; omitted on rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys: Option<ServerSys>,
    /// Value returned by the user handshake hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

impl HandshakeResponse {
    /// Successful response.
    pub fn ok(sys: ServerSys, user: Option<Value>) -> Self {
        Self {
            code: CODE_OK,
            sys: Some(sys),
            user,
        }
    }

    /// Rejection carrying only a code.
    pub fn error(code: u16) -> Self {
        Self {
            code,
            sys: None,
            user: None,
        }
    }

    /// Encode as a HANDSHAKE packet.
    pub fn to_packet(&self) -> Result<Vec<u8>, PacketError> {
        packet::encode(PacketType::Handshake, &json_bytes(self))
    }
}

/// Body of a KICK packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickBody {
    /// Human-readable reason.
    pub reason: String,
}

impl KickBody {
    /// Kick with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Encode as a KICK packet.
    pub fn to_packet(&self) -> Result<Vec<u8>, PacketError> {
        packet::encode(PacketType::Kick, &json_bytes(self))
    }
}

fn json_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain structs of strings, numbers and maps with string keys cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}
