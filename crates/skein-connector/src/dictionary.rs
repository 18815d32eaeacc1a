//! Route compression dictionary.
//!
//! Handler routes are sorted and numbered from 1 so every server in a cluster
//! derives the same codes from the same route set. Extra user routes follow in
//! the order given.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

/// Errors raised while building a dictionary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DictionaryError {
    /// More routes than 16-bit codes.
    #[error("{0} routes do not fit in 16-bit codes")]
    TooManyRoutes(usize),
}

/// Bidirectional route/code table.
#[derive(Debug, Clone, Default)]
pub struct RouteDictionary {
    route_to_code: BTreeMap<String, u16>,
    code_to_route: HashMap<u16, String>,
    version: String,
}

impl RouteDictionary {
    /// Build from handler routes (sorted before numbering) and user routes.
    ///
    /// A route listed twice keeps its first code.
    pub fn new<R, U>(routes: R, user_routes: U) -> Result<Self, DictionaryError>
    where
        R: IntoIterator<Item = String>,
        U: IntoIterator<Item = String>,
    {
        let mut handler_routes: Vec<String> = routes.into_iter().collect();
        handler_routes.sort();
        handler_routes.dedup();

        let mut dict = Self::default();
        let mut next: usize = 1;
        for route in handler_routes.into_iter().chain(user_routes) {
            if dict.route_to_code.contains_key(&route) {
                continue;
            }
            let code = u16::try_from(next).map_err(|_| DictionaryError::TooManyRoutes(next))?;
            dict.code_to_route.insert(code, route.clone());
            dict.route_to_code.insert(route, code);
            next += 1;
        }
        dict.version = Self::digest(&dict.route_to_code);
        Ok(dict)
    }

    fn digest(route_to_code: &BTreeMap<String, u16>) -> String {
        let canonical = serde_json::to_vec(route_to_code).unwrap_or_default();
        STANDARD.encode(Sha256::digest(&canonical))
    }

    /// Code for `route`.
    pub fn code_of(&self, route: &str) -> Option<u16> {
        self.route_to_code.get(route).copied()
    }

    /// Route for `code`.
    pub fn route_of(&self, code: u16) -> Option<&str> {
        self.code_to_route.get(&code).map(String::as_str)
    }

    /// Digest of the table; equal tables have equal versions.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Route to code table as sent to clients.
    pub fn route_to_code(&self) -> BTreeMap<String, u16> {
        self.route_to_code.clone()
    }

    /// Code to route table as sent to clients, keyed by decimal code.
    pub fn code_to_route(&self) -> BTreeMap<String, String> {
        self.code_to_route
            .iter()
            .map(|(code, route)| (code.to_string(), route.clone()))
            .collect()
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.route_to_code.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.route_to_code.is_empty()
    }
}
