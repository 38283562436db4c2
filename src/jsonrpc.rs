//! JSON-RPC 2.0 envelope codec.
//!
//! The proxy does not validate JSON-RPC semantics beyond extracting `id` and
//! `method`, so parsing here is deliberately lenient: every field is optional
//! and `params` is carried as raw JSON so the bytes that reach the upstream
//! are exactly the bytes the client sent.
//!
//! # ID Handling
//!
//! Any JSON value is accepted as a request id, and the id is echoed back in
//! error replies with its exact type (`1` stays a number, `"1"` stays a
//! string). A request without an id is a notification; a request with an
//! explicit `"id": null` is not. The two cases are distinguished during
//! deserialization: an absent field becomes `None`, a present `null` becomes
//! `Some(Value::Null)`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

/// JSON-RPC protocol version emitted in replies.
const JSONRPC_VERSION: &str = "2.0";

/// A single JSON-RPC 2.0 request envelope.
///
/// Field order matters: re-serialization (multi-mode method rewriting) emits
/// fields in declaration order, producing `jsonrpc`, `id`, `method`, `params`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RpcEnvelope {
    /// Protocol version as sent by the client. Not validated.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Request id. `None` means the field was absent (a notification);
    /// `Some(Value::Null)` means an explicit `"id": null`.
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
    /// Method name. Empty when the field was absent.
    #[serde(default)]
    pub method: String,
    /// Raw parameter bytes, preserved verbatim to avoid re-serialization
    /// drift.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Deserializer for the `id` field. Only invoked when the field is present,
/// so an explicit `null` surfaces as `Some(Value::Null)` instead of `None`.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RpcEnvelope {
    /// Returns true if this request is a notification (no `id` field).
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Parse a single JSON-RPC request from a frame.
///
/// Fails only on malformed JSON or a mistyped field; missing fields are
/// defaulted so that routing can report more specific failures later.
pub fn parse(bytes: &[u8]) -> Result<RpcEnvelope, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Best-effort method extraction for observability labels.
///
/// Returns `"-"` when the frame does not parse or carries no method.
pub fn method_of(bytes: &[u8]) -> String {
    match parse(bytes) {
        Ok(env) if !env.method.is_empty() => env.method,
        _ => "-".to_string(),
    }
}

/// Best-effort id extraction, used when a frame fails envelope parsing but
/// still contains recoverable JSON (for example a non-string `method`).
pub fn id_of(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v.get("id").cloned())
}

/// JSON-RPC 2.0 error reply.
///
/// The `id` field is always emitted, as `null` when the request id could not
/// be recovered.
#[derive(Debug, Serialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub error: RpcErrorObject,
}

/// The `error` member of an error reply.
#[derive(Debug, Serialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
}

impl RpcErrorResponse {
    /// Build an error reply echoing `id` (or `null` when absent).
    pub fn new(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.unwrap_or(Value::Null),
            error: RpcErrorObject {
                code,
                message: message.into(),
            },
        }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32000,"message":"internal error"}}"#
                .to_string()
        })
    }
}
