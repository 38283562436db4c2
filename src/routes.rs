//! Proxy rules and method-prefix routing.
//!
//! A [`ProxyRule`] maps a WebSocket mount path to an upstream JSON-RPC
//! endpoint. The [`RouteTable`] is built once at startup and never mutated.
//!
//! Endpoints run in one of two modes:
//!
//! - **Single mode**: the endpoint is bound at a rule's `src` and every frame
//!   goes to that rule's `dst_url`, body untouched.
//! - **Multi mode**: one endpoint at `/` owns the whole table. The method is
//!   split at the first `.`; the part before the dot selects the rule (as
//!   `/<prefix>`) and the part after it becomes the upstream method.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::error::GatewayError;
use crate::jsonrpc::RpcEnvelope;

/// Immutable mapping from a WebSocket mount path to an upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    /// WebSocket mount path, e.g. `/rpc`.
    pub src: String,
    /// Upstream JSON-RPC endpoint, e.g. `http://localhost/rpc`.
    pub dst_url: String,
}

impl ProxyRule {
    /// Parse a `src:dst_url` CLI value, splitting at the first colon so the
    /// scheme separator in the URL survives.
    pub fn parse(value: &str) -> Result<Self, GatewayError> {
        let Some((src, dst_url)) = value.split_once(':') else {
            return Err(GatewayError::InvalidRoute(value.to_string()));
        };
        if !src.starts_with('/') || dst_url.is_empty() {
            return Err(GatewayError::InvalidRoute(value.to_string()));
        }
        Ok(Self {
            src: src.to_string(),
            dst_url: dst_url.to_string(),
        })
    }
}

/// Method rewrite failures, reported to clients as method-not-found.
///
/// The display strings are part of the wire protocol and must not change.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RewriteError {
    /// The method contains no `.` to split a routing prefix from.
    #[error("method has no prefix with .")]
    MethodFormat,
    /// The method prefix does not name a configured rule.
    #[error("invalid prefix: dstUrl was not found")]
    InvalidPrefix,
}

/// Ordered rule list with a keyed lookup by `src`. Read-only after startup.
#[derive(Debug)]
pub struct RouteTable {
    rules: Vec<ProxyRule>,
    by_src: HashMap<String, usize>,
}

impl RouteTable {
    pub fn new(rules: Vec<ProxyRule>) -> Self {
        let by_src = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.src.clone(), i))
            .collect();
        Self { rules, by_src }
    }

    pub fn rules(&self) -> &[ProxyRule] {
        &self.rules
    }

    pub fn get(&self, src: &str) -> Option<&ProxyRule> {
        self.by_src.get(src).map(|&i| &self.rules[i])
    }

    /// Multi-mode rewrite.
    ///
    /// Splits the envelope's method at the first `.`, resolves the prefix
    /// against the table, and returns the envelope with the method shortened
    /// to the part after the dot, together with the selected rule. Fails
    /// without touching the envelope.
    pub fn rewrite(&self, mut env: RpcEnvelope) -> Result<(RpcEnvelope, &ProxyRule), RewriteError> {
        let Some((prefix, rest)) = env.method.split_once('.') else {
            return Err(RewriteError::MethodFormat);
        };
        let src = format!("/{prefix}");
        let rule = self.get(&src).ok_or(RewriteError::InvalidPrefix)?;
        env.method = rest.to_string();
        Ok((env, rule))
    }
}

/// Routing mode of one WebSocket endpoint.
#[derive(Clone)]
pub enum RouteMode {
    /// Fixed 1-to-1 forwarding to a single upstream.
    Single { dst_url: String },
    /// Prefix-based dispatch across the whole table.
    Multi { table: Arc<RouteTable> },
}
