//! Handshake negotiation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use skein_protocol::{
    CODE_OLD_CLIENT, CODE_USE_ERROR, HandshakeRequest, HandshakeResponse, ServerSys,
};
use skein_session::SessionId;

use crate::dictionary::RouteDictionary;
use crate::schema::SchemaCodec;

/// Accepts or rejects a client by `(type, version)`.
pub type ClientCheck = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Application hook run after protocol checks pass.
#[async_trait]
pub trait HandshakeHook: Send + Sync {
    /// `Ok(user)` accepts, putting `user` into the response; `Err` rejects
    /// with code 500.
    async fn handshake(
        &self,
        request: &HandshakeRequest,
        session: SessionId,
    ) -> Result<Option<Value>, String>;
}

/// Result of a handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Send this response and wait for the ack.
    Accepted(HandshakeResponse),
    /// Send this code and disconnect.
    Rejected(u16),
}

/// Builds handshake responses from the connector's settings.
#[derive(Clone, Default)]
pub struct HandshakeCommand {
    heartbeat_secs: Option<u64>,
    check_client: Option<ClientCheck>,
    hook: Option<Arc<dyn HandshakeHook>>,
    dictionary: Option<Arc<RouteDictionary>>,
    schema: Option<Arc<dyn SchemaCodec>>,
}

impl HandshakeCommand {
    /// `heartbeat_secs` is advertised to clients; `None` disables heartbeats.
    pub fn new(heartbeat_secs: Option<u64>) -> Self {
        Self {
            heartbeat_secs,
            ..Self::default()
        }
    }

    /// Reject clients the predicate refuses with code 501.
    pub fn with_client_check(mut self, check: ClientCheck) -> Self {
        self.check_client = Some(check);
        self
    }

    /// Run `hook` after the protocol checks.
    pub fn with_hook(mut self, hook: Arc<dyn HandshakeHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Advertise route compression.
    pub fn with_dictionary(mut self, dictionary: Arc<RouteDictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// Advertise schema bodies.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaCodec>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Negotiate with a client.
    pub async fn handle(&self, request: &HandshakeRequest, session: SessionId) -> HandshakeOutcome {
        let Some(sys) = &request.sys else {
            return HandshakeOutcome::Rejected(CODE_USE_ERROR);
        };

        if let Some(check) = &self.check_client
            && !check(&sys.client_type, &sys.version)
        {
            return HandshakeOutcome::Rejected(CODE_OLD_CLIENT);
        }

        let mut server_sys = ServerSys {
            heartbeat: self.heartbeat_secs,
            ..ServerSys::default()
        };

        if let Some(dictionary) = &self.dictionary {
            let version = dictionary.version();
            if sys.dict_version.as_deref() != Some(version) {
                let route_to_code = dictionary.route_to_code();
                server_sys.dict = Some(route_to_code.clone());
                server_sys.route_to_code = Some(route_to_code);
                server_sys.code_to_route = Some(dictionary.code_to_route());
                server_sys.dict_version = Some(version.to_string());
            }
            server_sys.use_dict = Some(true);
        }

        if let Some(schema) = &self.schema {
            if sys.proto_version.as_deref() != Some(schema.version().as_str()) {
                server_sys.protos = Some(schema.protos());
            }
            server_sys.use_proto = Some(true);
        }

        let user = match &self.hook {
            Some(hook) => match hook.handshake(request, session).await {
                Ok(user) => user,
                Err(reason) => {
                    tracing::debug!("handshake hook rejected session {session}: {reason}");
                    return HandshakeOutcome::Rejected(CODE_USE_ERROR);
                }
            },
            None => None,
        };

        HandshakeOutcome::Accepted(HandshakeResponse::ok(server_sys, user))
    }
}
