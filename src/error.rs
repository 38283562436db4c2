//! Error taxonomy for the gateway.
//!
//! Two layers of failure exist. [`GatewayError`] covers startup and
//! configuration problems, which are fatal and terminate the process with a
//! nonzero exit. [`ForwardError`] covers per-request failures, which are
//! reported to the client as JSON-RPC error envelopes and never escape the
//! session that produced them.
//!
//! # Error Code Mapping
//!
//! | Variant | JSON-RPC code |
//! |---------|---------------|
//! | `Parse`, `Timeout`, `Transport` | `-32000` |
//! | `Rewrite` | `-32601` |
//! | `UpstreamStatus(s)` | `-1 * s` (e.g. 502 becomes -502) |
//! | `BodyRead` | `-200` |
//!
//! Client-visible messages are sanitized: transport failures map to fixed
//! strings so upstream URLs and connection details never leak into replies.
//! The underlying errors are logged server-side instead.

use thiserror::Error;

use crate::routes::RewriteError;

/// Fatal startup and configuration errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No proxy rules were configured.
    #[error("no proxy rules were defined")]
    NoRoutes,

    /// A `--route` value did not parse as `src:dst_url`.
    #[error("invalid route {0:?}: expected src:dst_url like /rpc:http://localhost/rpc")]
    InvalidRoute(String),

    /// The upstream HTTP client could not be constructed.
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server loop failed.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Per-request dispatch failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The frame was not a parseable JSON-RPC request.
    #[error("invalid JSON-RPC request")]
    Parse,

    /// Multi-mode method rewriting failed.
    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    /// The upstream request exceeded the per-request deadline.
    #[error("upstream request timed out")]
    Timeout,

    /// The upstream request failed before a response was obtained.
    #[error("upstream request failed")]
    Transport,

    /// The upstream answered with a non-200 status.
    #[error("upstream returned HTTP {0}")]
    UpstreamStatus(u16),

    /// The upstream response body could not be read to completion.
    #[error("failed to read upstream response")]
    BodyRead,
}

impl ForwardError {
    /// JSON-RPC error code for the client-visible envelope.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Parse | Self::Timeout | Self::Transport => -32000,
            Self::Rewrite(_) => -32601,
            Self::UpstreamStatus(status) => -i32::from(*status),
            Self::BodyRead => -200,
        }
    }

    /// Outcome label for the request counter: `ok`, `timeout`, or `error`.
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            _ => "error",
        }
    }

    /// Code label for the duration metric: the HTTP status when a response
    /// was obtained, the JSON-RPC error code otherwise.
    pub fn code_label(&self) -> String {
        match self {
            Self::UpstreamStatus(status) => status.to_string(),
            _ => self.jsonrpc_code().to_string(),
        }
    }

    /// Sanitized message for the client-visible error envelope.
    ///
    /// Upstream non-200 replies carry an empty message (the status is already
    /// encoded in the code). Rewrite failures keep their own messages, which
    /// reference nothing internal.
    pub fn client_message(&self) -> String {
        match self {
            Self::UpstreamStatus(_) => String::new(),
            other => other.to_string(),
        }
    }
}
